//! Per-message processing state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use dynmap_core::{Error, Mapping};

use crate::request::PlatformRequest;
use crate::value::SubstituteValue;

/// Accumulator owned by the task processing one message.
///
/// The cache maps target paths to the values extracted for them, in the
/// order the substitutions produced them. Requests refer to earlier requests
/// of the same context by index.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub mapping: Arc<Mapping>,
    pub topic: String,
    /// Decoded and augmented source payload.
    pub payload: Value,
    pub cache: BTreeMap<String, Vec<SubstituteValue>>,
    pub requests: Vec<PlatformRequest>,
    /// Rule-local failures that did not stop processing.
    pub errors: Vec<Error>,
    /// False for dry runs.
    pub send_payload: bool,
    /// Set when the inbound filter rejected the message.
    pub filtered: bool,
    pub publish_topic: Option<String>,
    pub source_id: Option<String>,
    pub external_id: Option<String>,
}

impl ProcessingContext {
    pub fn new(mapping: Arc<Mapping>, topic: impl Into<String>, send_payload: bool) -> Self {
        Self {
            mapping,
            topic: topic.into(),
            payload: Value::Null,
            cache: BTreeMap::new(),
            requests: Vec::new(),
            errors: Vec::new(),
            send_payload,
            filtered: false,
            publish_topic: None,
            source_id: None,
            external_id: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn add_value(&mut self, path: impl Into<String>, value: SubstituteValue) {
        self.cache.entry(path.into()).or_default().push(value);
    }

    pub fn values(&self, path: &str) -> &[SubstituteValue] {
        self.cache.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of values extracted for a target path.
    pub fn cardinality(&self, path: &str) -> usize {
        self.cache.get(path).map_or(0, Vec::len)
    }

    /// Append a request and return its index.
    pub fn add_request(&mut self, request: PlatformRequest) -> usize {
        self.requests.push(request);
        self.requests.len() - 1
    }

    pub fn add_error(&mut self, error: Error) {
        self.errors.push(error);
    }

    pub fn is_dry_run(&self) -> bool {
        !self.send_payload
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.requests.iter().any(PlatformRequest::has_error)
    }

    /// Hand the request list to the dispatch layer.
    pub fn into_requests(self) -> Vec<PlatformRequest> {
        self.requests
    }
}
