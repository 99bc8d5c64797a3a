//! Save-time mapping validation.
//!
//! Processing assumes validated mappings, so every structural rule is checked
//! here and reported back to the configuration layer in one pass.

use thiserror::Error;

use crate::config::fields;
use crate::mapping::{Direction, Mapping, MappingType};
use crate::target::{self, TargetError};
use crate::topic::{self, TopicError};

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("mapping id must not be empty")]
    MissingId,
    #[error("invalid mapping topic: {0}")]
    MappingTopic(TopicError),
    #[error("invalid template topic: {0}")]
    TemplateTopic(TopicError),
    #[error("template topic '{template}' does not match mapping topic '{topic}'")]
    TemplateTopicMismatch { topic: String, template: String },
    #[error("{count} substitutions define the device identifier, at most one is allowed")]
    MultipleDeviceIdentifiers { count: usize },
    #[error("no substitution defines the device identifier")]
    MissingDeviceIdentifier,
    #[error("{which} template is not a JSON object: {reason}")]
    TemplateNotJson { which: &'static str, reason: String },
    #[error("substitution {index} has an empty {which} path")]
    EmptySubstitutionPath { index: usize, which: &'static str },
    #[error("substitution {index} has an invalid target path: {source}")]
    InvalidTargetPath { index: usize, source: TargetError },
    #[error("outbound mapping requires a publish topic")]
    MissingPublishTopic,
    #[error("publish topic '{0}' must not contain '#'")]
    PublishTopicMultiLevelWildcard(String),
    #[error("outbound mapping requires a filter field")]
    MissingOutboundFilter,
}

/// Validate a mapping, collecting every finding.
pub fn validate_mapping(mapping: &Mapping) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if mapping.id.trim().is_empty() {
        errors.push(ValidationError::MissingId);
    }

    let identifier_count = mapping
        .substitutions
        .iter()
        .filter(|s| s.defines_device_identifier)
        .count();
    if identifier_count > 1 {
        errors.push(ValidationError::MultipleDeviceIdentifiers {
            count: identifier_count,
        });
    }

    for (index, sub) in mapping.substitutions.iter().enumerate() {
        if sub.path_source.trim().is_empty() {
            errors.push(ValidationError::EmptySubstitutionPath { index, which: "source" });
        }
        if sub.path_target.trim().is_empty() {
            errors.push(ValidationError::EmptySubstitutionPath { index, which: "target" });
        } else if let Err(source) = target::parse_target(&sub.path_target) {
            errors.push(ValidationError::InvalidTargetPath { index, source });
        }
    }

    // Flat-file, binary and script payloads have no JSON source sample.
    if mapping.mapping_type == MappingType::Json {
        check_template(&mapping.source_template, "source", &mut errors);
    }
    check_template(&mapping.target_template, "target", &mut errors);

    match mapping.direction {
        Direction::Inbound => validate_inbound(mapping, &mut errors),
        Direction::Outbound => validate_outbound(mapping, &mut errors),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_inbound(mapping: &Mapping, errors: &mut Vec<ValidationError>) {
    if let Err(e) = topic::validate_wildcards(&mapping.mapping_topic) {
        errors.push(ValidationError::MappingTopic(e));
        return;
    }

    let template = mapping.effective_topic();
    if let Err(e) = topic::validate_wildcards(template) {
        errors.push(ValidationError::TemplateTopic(e));
    } else if !topic::topic_matches(&mapping.mapping_topic, template) {
        errors.push(ValidationError::TemplateTopicMismatch {
            topic: mapping.mapping_topic.clone(),
            template: template.to_string(),
        });
    }

    // Inventory requests may create the device themselves.
    let needs_identifier = mapping.target_api.identifier_path().is_some()
        && matches!(mapping.mapping_type, MappingType::Json | MappingType::FlatFile | MappingType::Binary);
    if needs_identifier && mapping.identifier_substitution().is_none() {
        errors.push(ValidationError::MissingDeviceIdentifier);
    }
}

fn validate_outbound(mapping: &Mapping, errors: &mut Vec<ValidationError>) {
    match mapping.publish_topic.as_deref() {
        None => errors.push(ValidationError::MissingPublishTopic),
        Some(t) if t.trim().is_empty() => errors.push(ValidationError::MissingPublishTopic),
        Some(t) => {
            if let Err(e) = topic::validate_wildcards(t) {
                errors.push(ValidationError::MappingTopic(e));
            } else if topic::tokenize_for_tree(t)
                .iter()
                .any(|l| l == topic::MULTI_LEVEL_WILDCARD)
            {
                errors.push(ValidationError::PublishTopicMultiLevelWildcard(t.to_string()));
            }
        }
    }

    let filter_missing = mapping
        .filter_outbound
        .as_deref()
        .map(|f| f.trim().is_empty())
        .unwrap_or(true);
    if filter_missing {
        errors.push(ValidationError::MissingOutboundFilter);
    }
}

fn check_template(template: &str, which: &'static str, errors: &mut Vec<ValidationError>) {
    match serde_json::from_str::<serde_json::Value>(template) {
        Ok(serde_json::Value::Object(map)) => {
            // Topic levels are synthesized per message, never templated.
            if which == "target" && map.contains_key(fields::TOPIC_LEVEL) {
                errors.push(ValidationError::TemplateNotJson {
                    which,
                    reason: format!("'{}' is reserved", fields::TOPIC_LEVEL),
                });
            }
        }
        Ok(_) => errors.push(ValidationError::TemplateNotJson {
            which,
            reason: "root is not an object".to_string(),
        }),
        Err(e) => errors.push(ValidationError::TemplateNotJson {
            which,
            reason: e.to_string(),
        }),
    }
}

/// Render findings as one message for the unified error type.
pub fn describe(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
