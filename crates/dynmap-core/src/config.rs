//! Engine configuration.
//!
//! Reserved field names shared by the extraction and assembly stages live here
//! next to the engine's tunables, so every crate agrees on the same constants.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config_err;
use crate::error::Result;

/// Reserved payload/target field names.
pub mod fields {
    /// Synthetic payload field holding the tokenized topic levels.
    pub const TOPIC_LEVEL: &str = "_TOPIC_LEVEL_";
    /// Wrapper field for payloads whose root is not a JSON object.
    pub const PAYLOAD: &str = "_PAYLOAD_";
    /// Target path carrying an external identifier that must be resolved.
    pub const IDENTITY_EXTERNAL_ID: &str = "_IDENTITY_.externalId";
    /// Target path carrying a platform-native identifier.
    pub const IDENTITY_SOURCE_ID: &str = "_IDENTITY_.c8ySourceId";
    /// Root of the identity pseudo-object, stripped from request bodies.
    pub const IDENTITY_ROOT: &str = "_IDENTITY_";
    /// Canonical time field.
    pub const TIME: &str = "time";
    /// Field holding the raw text of flat-file and binary payloads.
    pub const MESSAGE: &str = "message";
}

/// Default values.
pub mod defaults {
    pub const EXTERNAL_ID_TYPE: &str = "c8y_Serial";
    pub const MAX_EXPANDED_ELEMENTS: usize = 1_000;
    pub const IDENTITY_TIMEOUT_MS: u64 = 10_000;
    pub const LOG_FILTER: &str = "dynmap=info";
}

/// Environment variable names.
pub mod env_vars {
    pub const SEND_PAYLOAD: &str = "DYNMAP_SEND_PAYLOAD";
    pub const TIME_FIELD: &str = "DYNMAP_TIME_FIELD";
    pub const DEFAULT_EXTERNAL_ID_TYPE: &str = "DYNMAP_DEFAULT_EXTERNAL_ID_TYPE";
    pub const IDENTITY_CACHE: &str = "DYNMAP_IDENTITY_CACHE";
    pub const IDENTITY_TIMEOUT_MS: &str = "DYNMAP_IDENTITY_TIMEOUT_MS";
    pub const MAX_EXPANDED_ELEMENTS: &str = "DYNMAP_MAX_EXPANDED_ELEMENTS";
    pub const LOG_PAYLOADS: &str = "DYNMAP_LOG_PAYLOADS";
    pub const LOG_JSON: &str = "DYNMAP_LOG_JSON";
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// When false every message is processed as a dry run: no devices are
    /// created and unresolved identities do not fail the request.
    #[serde(default = "default_send_payload")]
    pub send_payload: bool,

    /// Name of the synthesized time field.
    #[serde(default = "default_time_field")]
    pub time_field: String,

    /// External id type used when a mapping leaves it empty.
    #[serde(default = "default_external_id_type")]
    pub default_external_id_type: String,

    /// Cache positive identity lookups across messages.
    #[serde(default = "default_identity_cache")]
    pub identity_cache: bool,

    /// Upper bound of one identity lookup or device creation, in milliseconds.
    #[serde(default = "default_identity_timeout_ms")]
    pub identity_timeout_ms: u64,

    /// Upper bound of elements produced by one expanded array.
    #[serde(default = "default_max_expanded_elements")]
    pub max_expanded_elements: usize,

    /// Log raw payloads at debug level.
    #[serde(default)]
    pub log_payloads: bool,
}

fn default_send_payload() -> bool { true }
fn default_time_field() -> String { fields::TIME.to_string() }
fn default_external_id_type() -> String { defaults::EXTERNAL_ID_TYPE.to_string() }
fn default_identity_cache() -> bool { true }
fn default_identity_timeout_ms() -> u64 { defaults::IDENTITY_TIMEOUT_MS }
fn default_max_expanded_elements() -> usize { defaults::MAX_EXPANDED_ELEMENTS }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_payload: default_send_payload(),
            time_field: default_time_field(),
            default_external_id_type: default_external_id_type(),
            identity_cache: default_identity_cache(),
            identity_timeout_ms: default_identity_timeout_ms(),
            max_expanded_elements: default_max_expanded_elements(),
            log_payloads: false,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        match crate::target::parse_target(&self.time_field) {
            Ok(segments) if !segments.is_empty() => {}
            Ok(_) => return Err(config_err!("time_field must not be the root")),
            Err(e) => return Err(config_err!("time_field '{}': {}", self.time_field, e)),
        }
        if self.default_external_id_type.trim().is_empty() {
            return Err(config_err!("default_external_id_type must not be empty"));
        }
        Ok(())
    }

    /// Load a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Load from environment variables only.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Override fields from environment variables that are set and parse.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse(env_vars::SEND_PAYLOAD) {
            self.send_payload = v;
        }
        if let Ok(v) = std::env::var(env_vars::TIME_FIELD) {
            if !v.trim().is_empty() {
                self.time_field = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var(env_vars::DEFAULT_EXTERNAL_ID_TYPE) {
            if !v.trim().is_empty() {
                self.default_external_id_type = v.trim().to_string();
            }
        }
        if let Some(v) = env_parse(env_vars::IDENTITY_CACHE) {
            self.identity_cache = v;
        }
        if let Some(v) = env_parse(env_vars::IDENTITY_TIMEOUT_MS) {
            self.identity_timeout_ms = v;
        }
        if let Some(v) = env_parse(env_vars::MAX_EXPANDED_ELEMENTS) {
            self.max_expanded_elements = v;
        }
        if let Some(v) = env_parse(env_vars::LOG_PAYLOADS) {
            self.log_payloads = v;
        }
        self
    }

    pub fn identity_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.identity_timeout_ms)
    }

    /// Builder-style dry-run switch.
    pub fn dry_run(mut self) -> Self {
        self.send_payload = false;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
