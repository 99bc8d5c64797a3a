//! Mapping definitions.
//!
//! A [`Mapping`] ties a topic pattern to an ordered list of [`Substitution`]
//! rules and the platform API the generated requests address. Mappings are
//! created by the configuration layer, validated on save and are immutable
//! while a message is processed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::fields;
use crate::error::Result;

/// Platform API addressed by a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Api {
    Measurement,
    Event,
    Alarm,
    Inventory,
    Operation,
}

impl Api {
    pub fn as_str(&self) -> &'static str {
        match self {
            Api::Measurement => "MEASUREMENT",
            Api::Event => "EVENT",
            Api::Alarm => "ALARM",
            Api::Inventory => "INVENTORY",
            Api::Operation => "OPERATION",
        }
    }

    /// Path inside a request body that references the addressed device.
    ///
    /// Inventory requests carry the device id out of band, so there is no
    /// body path for them.
    pub fn identifier_path(&self) -> Option<&'static str> {
        match self {
            Api::Measurement | Api::Event | Api::Alarm => Some("source.id"),
            Api::Operation => Some("deviceId"),
            Api::Inventory => None,
        }
    }

    /// Whether requests of this API carry a `time` field.
    pub fn requires_time(&self) -> bool {
        !matches!(self, Api::Inventory | Api::Operation)
    }
}

impl std::fmt::Display for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message flow direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Connector to platform.
    #[default]
    Inbound,
    /// Platform to connector.
    Outbound,
}

/// Wire format of the source payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingType {
    #[default]
    Json,
    FlatFile,
    Binary,
    Protobuf,
    /// Script-based mapping executed by an external processor.
    CodeBased,
}

/// Policy for missing, null or array-valued substitution results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairStrategy {
    #[default]
    Default,
    UseFirstValueOfArray,
    UseLastValueOfArray,
    Ignore,
    RemoveIfMissingOrNull,
    CreateIfMissing,
}

/// MQTT quality of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// One extraction/injection rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Substitution {
    /// Expression evaluated against the source payload.
    pub path_source: String,
    /// Dot path written in the target payload.
    pub path_target: String,
    #[serde(default)]
    pub repair_strategy: RepairStrategy,
    #[serde(default)]
    pub expand_array: bool,
    #[serde(default)]
    pub defines_device_identifier: bool,
}

impl Substitution {
    pub fn new(path_source: impl Into<String>, path_target: impl Into<String>) -> Self {
        Self {
            path_source: path_source.into(),
            path_target: path_target.into(),
            repair_strategy: RepairStrategy::Default,
            expand_array: false,
            defines_device_identifier: false,
        }
    }

    pub fn with_repair_strategy(mut self, strategy: RepairStrategy) -> Self {
        self.repair_strategy = strategy;
        self
    }

    pub fn expand_array(mut self) -> Self {
        self.expand_array = true;
        self
    }

    pub fn device_identifier(mut self) -> Self {
        self.defines_device_identifier = true;
        self
    }
}

/// Whether a target path is one of the reserved identity paths.
pub fn is_identity_path(path: &str) -> bool {
    path == fields::IDENTITY_EXTERNAL_ID || path == fields::IDENTITY_SOURCE_ID
}

/// A configured transformation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub direction: Direction,
    /// Subscription topic, may contain wildcards.
    #[serde(default)]
    pub mapping_topic: String,
    /// Template topic used for tree insertion; falls back to `mapping_topic`.
    #[serde(default)]
    pub mapping_topic_sample: String,
    /// Topic pattern outbound payloads are published to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_topic: Option<String>,
    #[serde(rename = "targetAPI")]
    pub target_api: Api,
    #[serde(default = "empty_object")]
    pub source_template: String,
    #[serde(default = "empty_object")]
    pub target_template: String,
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
    #[serde(default)]
    pub qos: Qos,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub map_device_identifier: bool,
    #[serde(default)]
    pub create_non_existing_device: bool,
    #[serde(default)]
    pub update_existing_device: bool,
    #[serde(default)]
    pub external_id_type: String,
    /// `type` given to devices this mapping creates implicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub mapping_type: MappingType,
    /// Inbound filter expression; a falsy result skips the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_mapping: Option<String>,
    /// Outbound filter: the platform object must carry this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_outbound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

fn empty_object() -> String {
    "{}".to_string()
}

fn default_true() -> bool {
    true
}

impl Mapping {
    /// Create an active inbound JSON mapping with a random id.
    pub fn new(topic: impl Into<String>, target_api: Api) -> Self {
        let topic = topic.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: String::new(),
            direction: Direction::Inbound,
            mapping_topic: topic.clone(),
            mapping_topic_sample: topic,
            publish_topic: None,
            target_api,
            source_template: empty_object(),
            target_template: empty_object(),
            substitutions: Vec::new(),
            qos: Qos::default(),
            active: true,
            debug: false,
            map_device_identifier: false,
            create_non_existing_device: false,
            update_existing_device: false,
            external_id_type: String::new(),
            device_type: None,
            mapping_type: MappingType::Json,
            filter_mapping: None,
            filter_outbound: None,
            last_update: None,
        }
    }

    /// Create an outbound mapping publishing to `publish_topic`.
    pub fn outbound(
        target_api: Api,
        filter_outbound: impl Into<String>,
        publish_topic: impl Into<String>,
    ) -> Self {
        let publish_topic = publish_topic.into();
        let mut mapping = Self::new(publish_topic.clone(), target_api);
        mapping.direction = Direction::Outbound;
        mapping.publish_topic = Some(publish_topic);
        mapping.filter_outbound = Some(filter_outbound.into());
        mapping
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_template_topic(mut self, topic: impl Into<String>) -> Self {
        self.mapping_topic_sample = topic.into();
        self
    }

    pub fn with_source_template(mut self, template: impl Into<String>) -> Self {
        self.source_template = template.into();
        self
    }

    pub fn with_target_template(mut self, template: impl Into<String>) -> Self {
        self.target_template = template.into();
        self
    }

    pub fn with_substitution(mut self, substitution: Substitution) -> Self {
        self.substitutions.push(substitution);
        self
    }

    pub fn with_mapping_type(mut self, mapping_type: MappingType) -> Self {
        self.mapping_type = mapping_type;
        self
    }

    pub fn with_external_id_type(mut self, id_type: impl Into<String>) -> Self {
        self.external_id_type = id_type.into();
        self
    }

    pub fn with_filter(mut self, expression: impl Into<String>) -> Self {
        self.filter_mapping = Some(expression.into());
        self
    }

    pub fn map_device_identifier(mut self, enabled: bool) -> Self {
        self.map_device_identifier = enabled;
        self
    }

    pub fn create_non_existing_device(mut self, enabled: bool) -> Self {
        self.create_non_existing_device = enabled;
        self
    }

    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn update_existing_device(mut self, enabled: bool) -> Self {
        self.update_existing_device = enabled;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Topic used to position the mapping in the tree.
    pub fn effective_topic(&self) -> &str {
        if self.mapping_topic_sample.trim().is_empty() {
            &self.mapping_topic
        } else {
            &self.mapping_topic_sample
        }
    }

    /// Substitution whose target path defines the addressed device(s).
    ///
    /// An explicitly flagged substitution wins; otherwise the first
    /// substitution writing an identity path or the API's identifier path.
    pub fn identifier_substitution(&self) -> Option<&Substitution> {
        self.substitutions
            .iter()
            .find(|s| s.defines_device_identifier)
            .or_else(|| {
                self.substitutions.iter().find(|s| {
                    is_identity_path(&s.path_target)
                        || self.target_api.identifier_path() == Some(s.path_target.as_str())
                })
            })
    }

    /// Whether values of the identifier path are external ids to resolve.
    pub fn identifier_is_external(&self, path: &str) -> bool {
        if path == fields::IDENTITY_EXTERNAL_ID {
            return true;
        }
        if path == fields::IDENTITY_SOURCE_ID {
            return false;
        }
        self.map_device_identifier
    }

    /// Parse the target template.
    pub fn parsed_target_template(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.target_template)?)
    }

    /// Parse the source template.
    pub fn parsed_source_template(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.source_template)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse a JSON array of mappings.
pub fn mappings_from_json(content: &str) -> Result<Vec<Mapping>> {
    Ok(serde_json::from_str(content)?)
}
