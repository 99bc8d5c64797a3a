//! Device identity resolution.
//!
//! The engine consumes the platform's identity service through
//! [`IdentityResolver`]. Lookups may cross the network, so every call is an
//! await point; the engine never holds a lock on shared state across one.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use dynmap_core::{identity_err, Result};

/// An identifier of a device in an external system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalId {
    #[serde(rename = "type")]
    pub id_type: String,
    #[serde(rename = "externalId")]
    pub value: String,
}

impl ExternalId {
    pub fn new(id_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id_type: id_type.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id_type, self.value)
    }
}

/// Platform-native device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformId(pub String);

impl PlatformId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PlatformId {
    fn from(s: String) -> Self {
        PlatformId(s)
    }
}

impl From<&str> for PlatformId {
    fn from(s: &str) -> Self {
        PlatformId(s.to_string())
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attributes of a device created implicitly for an unknown external id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHints {
    pub name: String,
    pub device_type: Option<String>,
    /// Mapping that triggered the creation.
    pub mapping_id: String,
}

impl DeviceHints {
    pub fn for_external_id(external_id: &ExternalId, mapping_id: impl Into<String>) -> Self {
        Self {
            name: format!("device_{}_{}", external_id.id_type, external_id.value),
            device_type: None,
            mapping_id: mapping_id.into(),
        }
    }

    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Minimal managed-object representation submitted for creation.
    pub fn to_body(&self, external_id: &ExternalId) -> Value {
        let mut body = json!({
            "name": self.name,
            "c8y_IsDevice": {},
            "externalIds": [external_id],
        });
        if let Some(device_type) = &self.device_type {
            body["type"] = Value::String(device_type.clone());
        }
        body
    }
}

/// Identity service of the platform.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Platform id registered for an external id, `None` when unknown.
    async fn resolve_external_id(&self, external_id: &ExternalId) -> Result<Option<PlatformId>>;

    /// Create a device and register the external id for it.
    async fn create_device(&self, external_id: &ExternalId, hints: &DeviceHints) -> Result<PlatformId>;

    /// Reverse lookup: external id of the given type registered for a device.
    async fn resolve_platform_id(
        &self,
        _platform_id: &PlatformId,
        _id_type: &str,
    ) -> Result<Option<ExternalId>> {
        Ok(None)
    }
}

/// Run an identity call with an upper bound on its duration.
pub async fn with_timeout<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(identity_err!(
            "identity call timed out after {} ms",
            limit.as_millis()
        )),
    }
}

// ============================================================================
// In-memory resolver
// ============================================================================

/// Identity registry held in memory.
///
/// Used for tests and for deployments where identities are provisioned up
/// front.
#[derive(Debug, Default)]
pub struct InMemoryIdentityResolver {
    forward: DashMap<ExternalId, PlatformId>,
    reverse: DashMap<(PlatformId, String), String>,
    next_id: AtomicU64,
    lookups: AtomicU64,
}

impl InMemoryIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an external id for a device.
    pub fn register(&self, external_id: ExternalId, platform_id: impl Into<PlatformId>) {
        let platform_id = platform_id.into();
        self.reverse.insert(
            (platform_id.clone(), external_id.id_type.clone()),
            external_id.value.clone(),
        );
        self.forward.insert(external_id, platform_id);
    }

    /// Number of forward and reverse lookups served.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[async_trait]
impl IdentityResolver for InMemoryIdentityResolver {
    async fn resolve_external_id(&self, external_id: &ExternalId) -> Result<Option<PlatformId>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.forward.get(external_id).map(|e| e.value().clone()))
    }

    async fn create_device(&self, external_id: &ExternalId, hints: &DeviceHints) -> Result<PlatformId> {
        if let Some(existing) = self.forward.get(external_id) {
            return Ok(existing.value().clone());
        }
        let id = PlatformId(format!("{}", 10_000 + self.next_id.fetch_add(1, Ordering::Relaxed)));
        debug!("Created device '{}' ({}) for {}", hints.name, id, external_id);
        self.register(external_id.clone(), id.clone());
        Ok(id)
    }

    async fn resolve_platform_id(
        &self,
        platform_id: &PlatformId,
        id_type: &str,
    ) -> Result<Option<ExternalId>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .reverse
            .get(&(platform_id.clone(), id_type.to_string()))
            .map(|e| ExternalId::new(id_type, e.value().clone())))
    }
}

// ============================================================================
// Caching decorator
// ============================================================================

/// Caches positive lookups of another resolver.
///
/// Shared by all message tasks; misses are not cached so that devices
/// created elsewhere become visible on the next message.
pub struct CachingIdentityResolver {
    inner: Arc<dyn IdentityResolver>,
    forward: DashMap<ExternalId, PlatformId>,
    reverse: DashMap<(PlatformId, String), ExternalId>,
}

impl CachingIdentityResolver {
    pub fn new(inner: Arc<dyn IdentityResolver>) -> Self {
        Self {
            inner,
            forward: DashMap::new(),
            reverse: DashMap::new(),
        }
    }

    /// Drop cached entries of one external id.
    pub fn invalidate(&self, external_id: &ExternalId) {
        if let Some((_, platform_id)) = self.forward.remove(external_id) {
            self.reverse
                .remove(&(platform_id, external_id.id_type.clone()));
        }
    }

    pub fn clear(&self) {
        self.forward.clear();
        self.reverse.clear();
    }

    /// Number of cached external ids.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    fn remember(&self, external_id: &ExternalId, platform_id: &PlatformId) {
        self.forward.insert(external_id.clone(), platform_id.clone());
        self.reverse.insert(
            (platform_id.clone(), external_id.id_type.clone()),
            external_id.clone(),
        );
    }
}

#[async_trait]
impl IdentityResolver for CachingIdentityResolver {
    async fn resolve_external_id(&self, external_id: &ExternalId) -> Result<Option<PlatformId>> {
        // No shard guard may live across the await below.
        let cached = self.forward.get(external_id).map(|e| e.value().clone());
        if let Some(id) = cached {
            trace!("Identity cache hit for {}", external_id);
            return Ok(Some(id));
        }
        let resolved = self.inner.resolve_external_id(external_id).await?;
        if let Some(id) = &resolved {
            self.remember(external_id, id);
        }
        Ok(resolved)
    }

    async fn create_device(&self, external_id: &ExternalId, hints: &DeviceHints) -> Result<PlatformId> {
        let id = self.inner.create_device(external_id, hints).await?;
        self.remember(external_id, &id);
        Ok(id)
    }

    async fn resolve_platform_id(
        &self,
        platform_id: &PlatformId,
        id_type: &str,
    ) -> Result<Option<ExternalId>> {
        let key = (platform_id.clone(), id_type.to_string());
        let cached = self.reverse.get(&key).map(|e| e.value().clone());
        if let Some(ext) = cached {
            return Ok(Some(ext));
        }
        let resolved = self.inner.resolve_platform_id(platform_id, id_type).await?;
        if let Some(ext) = &resolved {
            self.remember(ext, platform_id);
        }
        Ok(resolved)
    }
}
