//! Payload decoding and augmentation.
//!
//! Inbound payloads are decoded according to the mapping type and extended
//! with the topic levels; outbound platform objects are extended with the
//! `_IDENTITY_` object so substitutions can address either identifier.

use serde_json::{json, Map, Value};

use dynmap_core::config::fields;
use dynmap_core::mapping::MappingType;
use dynmap_core::topic;
use dynmap_core::{extraction_err, Result};

use crate::identity::ExternalId;

/// Decode a raw payload into a JSON tree.
pub fn decode(mapping_type: MappingType, raw: &[u8]) -> Result<Value> {
    match mapping_type {
        MappingType::Json => {
            if raw.iter().all(u8::is_ascii_whitespace) {
                return Ok(Value::Object(Map::new()));
            }
            serde_json::from_slice(raw).map_err(|e| extraction_err!("payload is not JSON: {}", e))
        }
        MappingType::FlatFile => {
            let text = String::from_utf8_lossy(raw);
            Ok(json!({ fields::MESSAGE: text }))
        }
        MappingType::Binary => Ok(json!({ fields::MESSAGE: hex::encode(raw) })),
        MappingType::Protobuf | MappingType::CodeBased => Err(extraction_err!(
            "{:?} payloads are handled by an external processor",
            mapping_type
        )),
    }
}

fn into_object(payload: Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert(fields::PAYLOAD.to_string(), other);
            map
        }
    }
}

/// Add the topic levels of an inbound message.
///
/// Non-object roots are wrapped under `_PAYLOAD_` first.
pub fn augment_inbound(payload: Value, topic_name: &str) -> Value {
    let mut map = into_object(payload);
    let levels = topic::tokenize_for_payload(topic_name)
        .into_iter()
        .map(Value::String)
        .collect();
    map.insert(fields::TOPIC_LEVEL.to_string(), Value::Array(levels));
    Value::Object(map)
}

/// Add the identity of the device an outbound platform object belongs to.
pub fn augment_outbound(
    payload: Value,
    source_id: Option<&str>,
    external_id: Option<&ExternalId>,
) -> Value {
    let mut identity = Map::new();
    if let Some(id) = source_id {
        identity.insert("c8ySourceId".to_string(), Value::String(id.to_string()));
    }
    if let Some(ext) = external_id {
        identity.insert("externalIdType".to_string(), Value::String(ext.id_type.clone()));
        identity.insert("externalId".to_string(), Value::String(ext.value.clone()));
    }

    let mut map = into_object(payload);
    map.insert(fields::IDENTITY_ROOT.to_string(), Value::Object(identity));
    Value::Object(map)
}
