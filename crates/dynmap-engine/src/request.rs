//! Platform requests handed to the dispatch layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use dynmap_core::{Api, Result};

/// HTTP method of a platform request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// One unit of output of the engine.
///
/// `predecessor` indexes an earlier request of the same processing context
/// that must complete first, e.g. the implicit creation of the device a
/// measurement is posted for. The execution layer fills `response` and may
/// overwrite `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformRequest {
    #[serde(with = "predecessor_index")]
    pub predecessor: Option<usize>,
    pub method: RequestMethod,
    #[serde(rename = "targetAPI")]
    pub target_api: Api,
    pub source_id: Option<String>,
    pub external_id_type: String,
    pub external_id: Option<String>,
    /// Topic an outbound payload is published to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_topic: Option<String>,
    pub request_body: String,
    pub response: Option<String>,
    pub error: Option<String>,
}

impl PlatformRequest {
    pub fn new(method: RequestMethod, target_api: Api, request_body: impl Into<String>) -> Self {
        Self {
            predecessor: None,
            method,
            target_api,
            source_id: None,
            external_id_type: String::new(),
            external_id: None,
            publish_topic: None,
            request_body: request_body.into(),
            response: None,
            error: None,
        }
    }

    pub fn with_predecessor(mut self, predecessor: Option<usize>) -> Self {
        self.predecessor = predecessor;
        self
    }

    pub fn with_source_id(mut self, source_id: Option<String>) -> Self {
        self.source_id = source_id;
        self
    }

    pub fn with_external_id(mut self, id_type: impl Into<String>, value: Option<String>) -> Self {
        self.external_id_type = id_type.into();
        self.external_id = value;
        self
    }

    pub fn with_publish_topic(mut self, topic: impl Into<String>) -> Self {
        self.publish_topic = Some(topic.into());
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Parse the serialized body.
    pub fn body(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.request_body)?)
    }
}

/// `Option<usize>` on the wire as an integer, `-1` meaning none.
mod predecessor_index {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<usize>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(index) => serializer.serialize_i64(*index as i64),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<usize>, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Ok(usize::try_from(raw).ok())
    }
}
