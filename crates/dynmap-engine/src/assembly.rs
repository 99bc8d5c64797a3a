//! Assembly stage.
//!
//! Turns the processing cache into platform requests. Inbound, the values of
//! the identifier path are the device entries: each entry yields one request
//! (fan-out), preceded by an implicit device-creation request when the device
//! is unknown and the mapping allows creating it. Outbound, a single payload
//! is built and its publish topic is filled from `_TOPIC_LEVEL_`.
//!
//! Nothing here fails the message. Field errors are recorded on the context,
//! identity errors on the request they concern.

use std::collections::BTreeMap;
use std::future::Future;

use serde_json::Value;
use tracing::{debug, warn};

use dynmap_core::config::fields;
use dynmap_core::mapping::{Api, Direction, Mapping, RepairStrategy};
use dynmap_core::{assembly_err, topic, EngineConfig, Error, Result};

use crate::context::ProcessingContext;
use crate::identity::{self, DeviceHints, ExternalId, IdentityResolver};
use crate::path::{self, PathError, Segment};
use crate::request::{PlatformRequest, RequestMethod};
use crate::value::SubstituteValue;

/// Identity of one device entry.
#[derive(Debug, Default)]
struct EntryIdentity {
    source_id: Option<String>,
    external_id: Option<String>,
    predecessor: Option<usize>,
    error: Option<String>,
}

/// Builds platform requests from a filled processing context.
pub struct Assembler<'a> {
    config: &'a EngineConfig,
    identity: &'a dyn IdentityResolver,
}

impl<'a> Assembler<'a> {
    pub fn new(config: &'a EngineConfig, identity: &'a dyn IdentityResolver) -> Self {
        Self { config, identity }
    }

    fn external_id_type(&self, mapping: &Mapping) -> String {
        if mapping.external_id_type.trim().is_empty() {
            self.config.default_external_id_type.clone()
        } else {
            mapping.external_id_type.clone()
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        identity::with_timeout(self.config.identity_timeout(), call).await
    }

    /// Emit one request per device entry.
    pub async fn assemble_inbound(&self, ctx: &mut ProcessingContext) {
        let mapping = ctx.mapping.clone();
        let template = match mapping.parsed_target_template() {
            Ok(template) => template,
            Err(e) => {
                warn!("Target template of mapping '{}' is invalid: {}", mapping.id, e);
                ctx.add_error(e);
                return;
            }
        };

        let id_path = mapping
            .identifier_substitution()
            .map(|s| s.path_target.clone());
        let identifiers: Vec<SubstituteValue> = match &id_path {
            Some(path) => ctx.values(path).to_vec(),
            None => Vec::new(),
        };
        if id_path.is_some() && identifiers.is_empty() {
            debug!("Mapping '{}' produced no device entries", mapping.id);
            return;
        }
        let total = entry_count(&ctx.cache, id_path.as_deref()).max(identifiers.len()).max(1);

        let id_type = self.external_id_type(&mapping);
        for index in 0..total {
            let entry = if id_path.is_some() {
                Some(select(&identifiers, index).cloned().unwrap_or_else(|| {
                    SubstituteValue::ignore(RepairStrategy::Default)
                }))
            } else {
                None
            };
            let mut body = template.clone();
            let field_errors =
                write_fields(&ctx.cache, &mut body, index, id_path.as_deref(), Direction::Inbound);
            ctx.errors.extend(field_errors);

            let identity = self
                .resolve_entry(ctx, &mapping, id_path.as_deref(), entry.as_ref(), &id_type)
                .await;

            if let (Some(source_id), Some(target)) =
                (&identity.source_id, mapping.target_api.identifier_path())
            {
                let written = path::parse_target(target).and_then(|segments| {
                    path::set(&mut body, &segments, Value::String(source_id.clone()), true)
                });
                if let Err(e) = written {
                    ctx.add_error(e.into());
                }
            }
            path::remove(&mut body, &[Segment::Key(fields::IDENTITY_ROOT.to_string())]);

            let method = match mapping.target_api {
                Api::Inventory if mapping.update_existing_device && identity.source_id.is_some() => {
                    RequestMethod::Patch
                }
                _ => RequestMethod::Post,
            };

            if let Some(error) = &identity.error {
                warn!(
                    "Device entry {}/{} of mapping '{}': {}",
                    index + 1,
                    total,
                    mapping.id,
                    error
                );
            }

            let request = PlatformRequest::new(method, mapping.target_api, body.to_string())
                .with_predecessor(identity.predecessor)
                .with_source_id(identity.source_id.clone())
                .with_external_id(id_type.clone(), identity.external_id.clone())
                .with_error(identity.error);
            ctx.source_id = identity.source_id;
            ctx.external_id = identity.external_id;
            ctx.add_request(request);
        }
    }

    async fn resolve_entry(
        &self,
        ctx: &mut ProcessingContext,
        mapping: &Mapping,
        id_path: Option<&str>,
        entry: Option<&SubstituteValue>,
        id_type: &str,
    ) -> EntryIdentity {
        let mut identity = EntryIdentity::default();
        let (Some(id_path), Some(entry)) = (id_path, entry) else {
            return identity;
        };
        let Some(raw) = entry.as_identifier() else {
            identity.error = Some(format!("device identifier '{}' is missing", id_path));
            return identity;
        };

        if !mapping.identifier_is_external(id_path) {
            identity.source_id = Some(raw);
            return identity;
        }

        let external_id = ExternalId::new(id_type, raw.clone());
        identity.external_id = Some(raw);
        match self.bounded(self.identity.resolve_external_id(&external_id)).await {
            Ok(Some(platform_id)) => identity.source_id = Some(platform_id.0),
            // The inventory request creates the device itself.
            Ok(None) if mapping.target_api == Api::Inventory => {}
            Ok(None) if mapping.create_non_existing_device => {
                self.create_device(ctx, mapping, &external_id, &mut identity)
                    .await;
            }
            Ok(None) if ctx.is_dry_run() => {
                debug!("Dry run: no device registered for {}", external_id);
            }
            Ok(None) => {
                identity.error = Some(format!("no device registered for {}", external_id));
            }
            Err(e) => identity.error = Some(e.to_string()),
        }
        identity
    }

    /// Emit the creation request an entry's request depends on.
    ///
    /// Dry runs emit the request without creating the device.
    async fn create_device(
        &self,
        ctx: &mut ProcessingContext,
        mapping: &Mapping,
        external_id: &ExternalId,
        identity: &mut EntryIdentity,
    ) {
        let mut hints = DeviceHints::for_external_id(external_id, mapping.id.clone());
        if let Some(device_type) = &mapping.device_type {
            hints = hints.with_device_type(device_type.clone());
        }
        let mut request = PlatformRequest::new(
            RequestMethod::Post,
            Api::Inventory,
            hints.to_body(external_id).to_string(),
        )
        .with_external_id(external_id.id_type.clone(), Some(external_id.value.clone()));

        if ctx.send_payload {
            match self.bounded(self.identity.create_device(external_id, &hints)).await {
                Ok(platform_id) => {
                    debug!("Implicitly created device {} for {}", platform_id, external_id);
                    request.source_id = Some(platform_id.0.clone());
                    identity.source_id = Some(platform_id.0);
                }
                Err(e) => {
                    request.error = Some(e.to_string());
                    identity.error = Some(format!("implicit creation of {} failed", external_id));
                }
            }
        }
        identity.predecessor = Some(ctx.add_request(request));
    }

    /// Emit the single outbound request.
    pub fn assemble_outbound(&self, ctx: &mut ProcessingContext) {
        let mapping = ctx.mapping.clone();
        let Some(publish_topic) = mapping.publish_topic.as_deref() else {
            ctx.add_error(assembly_err!("mapping '{}' has no publish topic", mapping.id));
            return;
        };
        let mut body = match mapping.parsed_target_template() {
            Ok(Value::Object(object)) => Value::Object(object),
            Ok(_) => {
                ctx.add_error(assembly_err!("target template of '{}' is not an object", mapping.id));
                return;
            }
            Err(e) => {
                ctx.add_error(e);
                return;
            }
        };

        let levels = topic::tokenize_with_separators(publish_topic)
            .into_iter()
            .map(Value::String)
            .collect();
        if let Some(object) = body.as_object_mut() {
            object.insert(fields::TOPIC_LEVEL.to_string(), Value::Array(levels));
        }

        let field_errors = write_fields(&ctx.cache, &mut body, 0, None, Direction::Outbound);
        ctx.errors.extend(field_errors);

        let resolved_topic = path::remove(&mut body, &[Segment::Key(fields::TOPIC_LEVEL.to_string())])
            .map(|levels| join_levels(&levels))
            .unwrap_or_else(|| publish_topic.to_string());
        path::remove(&mut body, &[Segment::Key(fields::IDENTITY_ROOT.to_string())]);

        let unresolved = topic::tokenize_for_tree(&resolved_topic)
            .iter()
            .any(|level| topic::is_wildcard(level));
        let error = unresolved.then(|| format!("publish topic '{}' contains wildcards", resolved_topic));

        let request = PlatformRequest::new(RequestMethod::Post, mapping.target_api, body.to_string())
            .with_source_id(ctx.source_id.clone())
            .with_external_id(self.external_id_type(&mapping), ctx.external_id.clone())
            .with_publish_topic(resolved_topic.clone())
            .with_error(error);
        ctx.publish_topic = Some(resolved_topic);
        ctx.add_request(request);
    }
}

/// Largest cardinality among the non-identity target paths.
fn entry_count(cache: &BTreeMap<String, Vec<SubstituteValue>>, identifier_path: Option<&str>) -> usize {
    cache
        .iter()
        .filter(|(target, _)| {
            Some(target.as_str()) != identifier_path && !target.starts_with(fields::IDENTITY_ROOT)
        })
        .map(|(_, values)| values.len())
        .max()
        .unwrap_or(0)
}

fn join_levels(levels: &Value) -> String {
    match levels {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Value of a target path for device entry `index`.
///
/// Index `index` when present, else the only value, else the first or last
/// value as the repair strategy asks.
pub fn select(values: &[SubstituteValue], index: usize) -> Option<&SubstituteValue> {
    if let Some(value) = values.get(index) {
        return Some(value);
    }
    if values.len() == 1 {
        return values.first();
    }
    match values.first().map(|v| v.repair_strategy) {
        Some(RepairStrategy::UseFirstValueOfArray) => values.first(),
        Some(RepairStrategy::UseLastValueOfArray) => values.last(),
        _ => None,
    }
}

fn write_fields(
    cache: &BTreeMap<String, Vec<SubstituteValue>>,
    body: &mut Value,
    index: usize,
    identifier_path: Option<&str>,
    direction: Direction,
) -> Vec<Error> {
    let mut errors = Vec::new();
    for (target, values) in cache {
        if Some(target.as_str()) == identifier_path || target.starts_with(fields::IDENTITY_ROOT) {
            continue;
        }
        if let Err(e) = write_field(body, target, select(values, index), direction) {
            warn!("Cannot write '{}': {}", target, e);
            errors.push(e.into());
        }
    }
    errors
}

/// Write one value into a target payload honouring its repair strategy.
pub fn write_field(
    body: &mut Value,
    target: &str,
    value: Option<&SubstituteValue>,
    direction: Direction,
) -> std::result::Result<(), PathError> {
    let strategy = value.map_or(RepairStrategy::Default, |v| v.repair_strategy);
    let missing = value.map_or(true, SubstituteValue::is_missing);

    if target.trim() == path::ROOT {
        return match value {
            Some(v) if !missing => path::merge_into_root(body, v.value.clone()),
            _ => Ok(()),
        };
    }

    let segments = path::parse_target(target)?;
    if missing {
        // An unfilled topic level keeps its wildcard.
        if direction == Direction::Outbound && target.starts_with(fields::TOPIC_LEVEL) {
            return Ok(());
        }
        match strategy {
            RepairStrategy::RemoveIfMissingOrNull => {
                path::remove(body, &segments);
                return Ok(());
            }
            RepairStrategy::Ignore => return Ok(()),
            _ => {}
        }
    }

    let create = strategy == RepairStrategy::CreateIfMissing;
    if create && direction == Direction::Outbound && segments.len() > 1 {
        return Err(PathError::NestedCreate(target.to_string()));
    }

    let materialized = match value {
        Some(v) => v.materialize(path::get(body, &segments)),
        None => Value::Null,
    };
    path::set(body, &segments, materialized, create)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(s: &str, strategy: RepairStrategy) -> SubstituteValue {
        SubstituteValue::text(s, strategy)
    }

    #[test]
    fn test_select() {
        let three = vec![
            text("a", RepairStrategy::Default),
            text("b", RepairStrategy::Default),
            text("c", RepairStrategy::Default),
        ];
        assert_eq!(select(&three, 1).unwrap().value, json!("b"));
        assert!(select(&three, 3).is_none());

        let one = vec![text("only", RepairStrategy::UseLastValueOfArray)];
        assert_eq!(select(&one, 5).unwrap().value, json!("only"));

        let first = vec![
            text("x", RepairStrategy::UseFirstValueOfArray),
            text("y", RepairStrategy::UseFirstValueOfArray),
        ];
        assert_eq!(select(&first, 4).unwrap().value, json!("x"));

        let last = vec![
            text("x", RepairStrategy::UseLastValueOfArray),
            text("y", RepairStrategy::UseLastValueOfArray),
        ];
        assert_eq!(select(&last, 4).unwrap().value, json!("y"));

        assert!(select(&[], 0).is_none());
    }

    #[test]
    fn test_write_field_strategies() {
        let mut body = json!({"keep": 1, "drop": 2, "nested": {"v": 0}});

        let missing = SubstituteValue::ignore(RepairStrategy::RemoveIfMissingOrNull);
        write_field(&mut body, "drop", Some(&missing), Direction::Inbound).unwrap();
        assert!(body.get("drop").is_none());

        let ignored = SubstituteValue::ignore(RepairStrategy::Ignore);
        write_field(&mut body, "keep", Some(&ignored), Direction::Inbound).unwrap();
        assert_eq!(body["keep"], 1);

        let default_missing = SubstituteValue::ignore(RepairStrategy::Default);
        write_field(&mut body, "keep", Some(&default_missing), Direction::Inbound).unwrap();
        assert_eq!(body["keep"], Value::Null);

        let numeric_text = text("42", RepairStrategy::Default);
        write_field(&mut body, "nested.v", Some(&numeric_text), Direction::Inbound).unwrap();
        assert_eq!(body["nested"]["v"], 42);

        let err = write_field(&mut body, "absent.v", Some(&numeric_text), Direction::Inbound)
            .unwrap_err();
        assert_eq!(err, PathError::Missing("absent".to_string()));
    }

    #[test]
    fn test_missing_leaf_needs_create() {
        let mut body = json!({"c8y_Temperature": {"T": {"value": 0}}});
        let unit = text("C", RepairStrategy::Default);
        let err = write_field(&mut body, "c8y_Temperature.T.unit", Some(&unit), Direction::Inbound)
            .unwrap_err();
        assert_eq!(err, PathError::Missing("c8y_Temperature.T.unit".to_string()));
        assert_eq!(body, json!({"c8y_Temperature": {"T": {"value": 0}}}));

        let unit = text("C", RepairStrategy::CreateIfMissing);
        write_field(&mut body, "c8y_Temperature.T.unit", Some(&unit), Direction::Inbound).unwrap();
        assert_eq!(body["c8y_Temperature"]["T"]["unit"], "C");
    }

    #[test]
    fn test_huge_index_is_rejected() {
        let created = text("x", RepairStrategy::CreateIfMissing);
        let mut body = json!({});
        let err = write_field(
            &mut body,
            "list[18446744073709551615]",
            Some(&created),
            Direction::Inbound,
        )
        .unwrap_err();
        assert!(matches!(err, PathError::Target(_)));
        assert_eq!(body, json!({}));

        write_field(&mut body, "list[2]", Some(&created), Direction::Inbound).unwrap();
        assert_eq!(body, json!({"list": [null, null, "x"]}));
    }

    #[test]
    fn test_create_if_missing() {
        let created = text("on", RepairStrategy::CreateIfMissing);

        let mut body = json!({});
        write_field(&mut body, "a.b.c", Some(&created), Direction::Inbound).unwrap();
        assert_eq!(body, json!({"a": {"b": {"c": "on"}}}));

        let mut body = json!({});
        let err = write_field(&mut body, "a.b", Some(&created), Direction::Outbound).unwrap_err();
        assert_eq!(err, PathError::NestedCreate("a.b".to_string()));
        write_field(&mut body, "flag", Some(&created), Direction::Outbound).unwrap();
        assert_eq!(body, json!({"flag": "on"}));
    }

    #[test]
    fn test_root_merge() {
        let mut body = json!({"type": "t"});
        let object = SubstituteValue::classify(json!({"x": 1}), RepairStrategy::Default, false);
        write_field(&mut body, "$", Some(&object), Direction::Inbound).unwrap();
        assert_eq!(body, json!({"type": "t", "x": 1}));
    }

    #[test]
    fn test_entry_count_ignores_identity_paths() {
        let mut cache = BTreeMap::new();
        cache.insert(
            "_IDENTITY_.externalId".to_string(),
            vec![text("a", RepairStrategy::Default); 5],
        );
        cache.insert("text".to_string(), vec![text("x", RepairStrategy::Default); 3]);
        cache.insert("time".to_string(), vec![text("now", RepairStrategy::Default)]);
        assert_eq!(entry_count(&cache, Some("_IDENTITY_.externalId")), 3);
        assert_eq!(entry_count(&BTreeMap::new(), None), 0);
    }

    #[test]
    fn test_join_levels() {
        assert_eq!(join_levels(&json!(["evt", "/", "dev", "/", 7])), "evt/dev/7");
    }
}
