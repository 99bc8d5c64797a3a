//! Mapping engine.
//!
//! Owns the mapping set and publishes it to message tasks as an immutable
//! snapshot. Writers are serialized by a mutex, build a new snapshot off to
//! the side and swap it in; readers clone the current `Arc` and resolve
//! without holding any lock.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use dynmap_core::mapping::{Api, Direction, Mapping, MappingType};
use dynmap_core::tree::MappingTree;
use dynmap_core::validation::{self, validate_mapping};
use dynmap_core::{validation_err, EngineConfig, Error, Result};

use crate::assembly::Assembler;
use crate::clock::{Clock, SystemClock};
use crate::context::ProcessingContext;
use crate::extraction::Extractor;
use crate::identity::{self, CachingIdentityResolver, ExternalId, IdentityResolver, PlatformId};
use crate::path;
use crate::payload;
use crate::request::PlatformRequest;

/// Published, immutable view of the active mappings.
#[derive(Debug, Default)]
struct Snapshot {
    generation: u64,
    inbound: MappingTree,
    outbound: Vec<Arc<Mapping>>,
}

/// Outcome of publishing a new snapshot.
#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    pub generation: u64,
    /// Mappings in the inbound tree.
    pub inbound: usize,
    pub outbound: usize,
    /// Mappings kept in the set but not published.
    pub inactive: usize,
    /// Mappings excluded from the snapshot, with the reason.
    pub rejected: Vec<(String, Error)>,
}

impl RebuildReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Entry point for connectors.
pub struct MappingEngine {
    config: EngineConfig,
    identity: Arc<dyn IdentityResolver>,
    clock: Arc<dyn Clock>,
    active: RwLock<Arc<Snapshot>>,
    /// Full mapping set, in configuration order. Holding this lock serializes writers.
    mappings: Mutex<Vec<Arc<Mapping>>>,
}

impl MappingEngine {
    /// Create an engine with no mappings.
    ///
    /// The resolver is wrapped in a [`CachingIdentityResolver`] when identity
    /// caching is enabled.
    pub fn new(config: EngineConfig, identity: Arc<dyn IdentityResolver>) -> Self {
        let identity: Arc<dyn IdentityResolver> = if config.identity_cache {
            Arc::new(CachingIdentityResolver::new(identity))
        } else {
            identity
        };
        Self {
            config,
            identity,
            clock: Arc::new(SystemClock),
            active: RwLock::new(Arc::new(Snapshot::default())),
            mappings: Mutex::new(Vec::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Generation of the published snapshot; increases with every publish.
    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    /// All configured mappings, including inactive and rejected ones.
    pub fn mappings(&self) -> Vec<Arc<Mapping>> {
        self.mappings.lock().clone()
    }

    pub fn mapping(&self, id: &str) -> Option<Arc<Mapping>> {
        self.mappings.lock().iter().find(|m| m.id == id).cloned()
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.active.read().clone()
    }

    fn build_snapshot(mappings: &[Arc<Mapping>], generation: u64) -> (Snapshot, RebuildReport) {
        let mut report = RebuildReport {
            generation,
            ..RebuildReport::default()
        };
        let mut inbound = MappingTree::new();
        let mut outbound = Vec::new();

        for mapping in mappings {
            if !mapping.active {
                report.inactive += 1;
                continue;
            }
            if let Err(errors) = validate_mapping(mapping) {
                let e = validation_err!(validation::describe(&errors));
                warn!("Skipping mapping '{}': {}", mapping.id, e);
                report.rejected.push((mapping.id.clone(), e));
                continue;
            }
            match mapping.direction {
                Direction::Inbound => {
                    if let Err(e) = inbound.insert(mapping.clone()) {
                        warn!("Skipping mapping '{}': {}", mapping.id, e);
                        report.rejected.push((mapping.id.clone(), e));
                    }
                }
                Direction::Outbound => outbound.push(mapping.clone()),
            }
        }

        report.inbound = inbound.len();
        report.outbound = outbound.len();
        let snapshot = Snapshot {
            generation,
            inbound,
            outbound,
        };
        (snapshot, report)
    }

    fn publish(&self, snapshot: Snapshot) {
        info!(
            "Publishing mapping snapshot {} ({} inbound, {} outbound)",
            snapshot.generation,
            snapshot.inbound.len(),
            snapshot.outbound.len()
        );
        *self.active.write() = Arc::new(snapshot);
    }

    /// Replace the whole mapping set.
    pub fn rebuild<I>(&self, mappings: I) -> RebuildReport
    where
        I: IntoIterator<Item = Mapping>,
    {
        let mut set = self.mappings.lock();
        *set = mappings.into_iter().map(Arc::new).collect();
        let (snapshot, report) = Self::build_snapshot(&set, self.generation() + 1);
        self.publish(snapshot);
        report
    }

    /// Validate and add or replace a mapping.
    ///
    /// Nothing is published when the mapping is invalid or conflicts with
    /// the mappings already in the tree.
    pub fn upsert_mapping(&self, mut mapping: Mapping) -> Result<RebuildReport> {
        validate_mapping(&mapping).map_err(|errors| validation_err!(validation::describe(&errors)))?;
        mapping.last_update = Some(Utc::now());
        let mapping = Arc::new(mapping);

        let mut set = self.mappings.lock();
        let mut candidate = set.clone();
        match candidate.iter().position(|m| m.id == mapping.id) {
            Some(pos) => candidate[pos] = mapping.clone(),
            None => candidate.push(mapping.clone()),
        }

        let (snapshot, report) = Self::build_snapshot(&candidate, self.generation() + 1);
        if let Some((_, e)) = report.rejected.iter().find(|(id, _)| *id == mapping.id) {
            return Err(e.clone());
        }
        *set = candidate;
        self.publish(snapshot);
        Ok(report)
    }

    /// Remove a mapping. Returns the removed mapping, if any.
    pub fn delete_mapping(&self, id: &str) -> Option<Arc<Mapping>> {
        let mut set = self.mappings.lock();
        let pos = set.iter().position(|m| m.id == id)?;
        let removed = set.remove(pos);

        let current = self.snapshot();
        let mut inbound = current.inbound.clone();
        if removed.direction == Direction::Inbound {
            inbound.delete(&removed);
        }
        let outbound = current
            .outbound
            .iter()
            .filter(|m| m.id != id)
            .cloned()
            .collect();
        self.publish(Snapshot {
            generation: current.generation + 1,
            inbound,
            outbound,
        });
        Some(removed)
    }

    /// Inbound mappings matching a concrete topic.
    pub fn resolve_inbound(&self, topic: &str) -> Vec<Arc<Mapping>> {
        self.snapshot().inbound.resolve(topic)
    }

    /// Outbound mappings for a platform object of the given API.
    ///
    /// A mapping applies when the object carries its filter field.
    pub fn resolve_outbound(&self, api: Api, object: &Value) -> Vec<Arc<Mapping>> {
        self.snapshot()
            .outbound
            .iter()
            .filter(|m| m.target_api == api)
            .filter(|m| {
                m.filter_outbound
                    .as_deref()
                    .and_then(|f| path::parse_target(f).ok())
                    .and_then(|segments| path::get(object, &segments).cloned())
                    .is_some_and(|v| !v.is_null())
            })
            .cloned()
            .collect()
    }

    /// Process one message with one mapping.
    pub async fn process(&self, mapping: &Arc<Mapping>, payload: &[u8], topic: &str) -> Vec<PlatformRequest> {
        self.process_with_context(mapping, payload, topic)
            .await
            .into_requests()
    }

    /// Process one message with one mapping, returning the full context.
    ///
    /// Outbound mappings take the platform object as payload; `topic` is
    /// ignored for them.
    pub async fn process_with_context(
        &self,
        mapping: &Arc<Mapping>,
        payload: &[u8],
        topic: &str,
    ) -> ProcessingContext {
        match mapping.direction {
            Direction::Inbound => self.run_inbound(mapping, payload, topic).await,
            Direction::Outbound => match payload::decode(MappingType::Json, payload) {
                Ok(object) => self.run_outbound(mapping, object).await,
                Err(e) => {
                    let mut ctx = ProcessingContext::new(mapping.clone(), topic, self.config.send_payload);
                    ctx.add_error(e);
                    ctx
                }
            },
        }
    }

    /// Resolve an inbound topic and process the message with every match.
    ///
    /// Contexts are returned in resolution order.
    pub async fn process_inbound(&self, topic: &str, payload: &[u8]) -> Vec<ProcessingContext> {
        let mappings = self.resolve_inbound(topic);
        if mappings.is_empty() {
            debug!("No mapping for topic '{}'", topic);
            return Vec::new();
        }
        join_all(mappings.iter().map(|m| self.run_inbound(m, payload, topic))).await
    }

    /// Process a platform object with every applicable outbound mapping.
    pub async fn process_outbound(&self, api: Api, object: &Value) -> Vec<ProcessingContext> {
        let mappings = self.resolve_outbound(api, object);
        join_all(mappings.iter().map(|m| self.run_outbound(m, object.clone()))).await
    }

    async fn run_inbound(&self, mapping: &Arc<Mapping>, raw: &[u8], topic: &str) -> ProcessingContext {
        let mut ctx = ProcessingContext::new(mapping.clone(), topic, self.config.send_payload);
        if self.config.log_payloads {
            debug!(
                "Payload on '{}' for mapping '{}': {}",
                topic,
                mapping.id,
                String::from_utf8_lossy(raw)
            );
        }

        match payload::decode(mapping.mapping_type, raw) {
            Ok(decoded) => ctx.payload = payload::augment_inbound(decoded, topic),
            Err(e) => {
                warn!("Mapping '{}' cannot decode payload on '{}': {}", mapping.id, topic, e);
                ctx.add_error(e);
                return ctx;
            }
        }

        let extractor = Extractor::new(&self.config, self.clock.as_ref());
        if !extractor.passes_filter(&mut ctx) {
            debug!("Message on '{}' filtered by mapping '{}'", topic, mapping.id);
            ctx.filtered = true;
            return ctx;
        }
        extractor.extract(&mut ctx);

        Assembler::new(&self.config, self.identity.as_ref())
            .assemble_inbound(&mut ctx)
            .await;
        debug!(
            "Mapping '{}' produced {} request(s) for '{}'",
            mapping.id,
            ctx.requests.len(),
            topic
        );
        ctx
    }

    async fn run_outbound(&self, mapping: &Arc<Mapping>, object: Value) -> ProcessingContext {
        let topic = mapping.publish_topic.clone().unwrap_or_default();
        let mut ctx = ProcessingContext::new(mapping.clone(), topic, self.config.send_payload);
        let id_type = if mapping.external_id_type.trim().is_empty() {
            self.config.default_external_id_type.clone()
        } else {
            mapping.external_id_type.clone()
        };

        let source_id = platform_source_id(mapping.target_api, &object);
        let mut external_id: Option<ExternalId> = None;
        if let Some(id) = &source_id {
            let platform_id = PlatformId::from(id.as_str());
            let lookup = self.identity.resolve_platform_id(&platform_id, &id_type);
            match identity::with_timeout(self.config.identity_timeout(), lookup).await {
                Ok(found) => external_id = found,
                Err(e) => {
                    warn!("Reverse lookup of device {} failed: {}", id, e);
                    ctx.add_error(e);
                }
            }
        }
        ctx.source_id = source_id.clone();
        ctx.external_id = external_id.as_ref().map(|e| e.value.clone());
        ctx.payload = payload::augment_outbound(object, source_id.as_deref(), external_id.as_ref());

        Extractor::new(&self.config, self.clock.as_ref()).extract(&mut ctx);
        Assembler::new(&self.config, self.identity.as_ref()).assemble_outbound(&mut ctx);
        ctx
    }
}

/// Platform id of the device a platform object belongs to.
fn platform_source_id(api: Api, object: &Value) -> Option<String> {
    let target = api.identifier_path().unwrap_or("id");
    let segments = path::parse_target(target).ok()?;
    match path::get(object, &segments)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
