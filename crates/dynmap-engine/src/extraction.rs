//! Extraction stage.
//!
//! Evaluates every substitution of a mapping against the augmented payload
//! and fills the processing cache. Failures are local to one substitution:
//! they are logged, recorded on the context and stored as an ignore value.

use serde_json::Value;
use tracing::{debug, trace, warn};

use dynmap_core::mapping::{Direction, RepairStrategy, Substitution};
use dynmap_core::EngineConfig;

use crate::clock::{format_timestamp, Clock};
use crate::context::ProcessingContext;
use crate::path::{self, SourceExpression};
use crate::value::SubstituteValue;

/// Fills the processing cache of a context.
pub struct Extractor<'a> {
    config: &'a EngineConfig,
    clock: &'a dyn Clock,
}

impl<'a> Extractor<'a> {
    pub fn new(config: &'a EngineConfig, clock: &'a dyn Clock) -> Self {
        Self { config, clock }
    }

    /// Evaluate the inbound filter of the mapping.
    ///
    /// A filter that cannot be evaluated rejects the message.
    pub fn passes_filter(&self, ctx: &mut ProcessingContext) -> bool {
        let Some(filter) = ctx.mapping.filter_mapping.as_deref() else {
            return true;
        };
        if filter.trim().is_empty() {
            return true;
        }
        match path::evaluate_filter(filter, &ctx.payload) {
            Ok(passed) => passed,
            Err(e) => {
                warn!("Filter of mapping '{}' failed: {}", ctx.mapping.id, e);
                ctx.add_error(e.into());
                false
            }
        }
    }

    /// Evaluate all substitutions in mapping order.
    pub fn extract(&self, ctx: &mut ProcessingContext) {
        let mapping = ctx.mapping.clone();

        for sub in &mapping.substitutions {
            let evaluated = SourceExpression::compile(&sub.path_source)
                .and_then(|expr| expr.evaluate(&ctx.payload));
            let values = match evaluated {
                Ok(value) => self.classify(sub, value),
                Err(e) => {
                    warn!(
                        "Substitution '{}' of mapping '{}' failed: {}",
                        sub.path_source, mapping.id, e
                    );
                    ctx.add_error(e.into());
                    vec![SubstituteValue::ignore(sub.repair_strategy)]
                }
            };
            trace!("'{}' -> '{}': {} value(s)", sub.path_source, sub.path_target, values.len());
            for value in values {
                ctx.add_value(sub.path_target.as_str(), value);
            }
        }

        let time_mapped = mapping
            .substitutions
            .iter()
            .any(|s| s.path_target == self.config.time_field);
        if mapping.direction == Direction::Inbound
            && mapping.target_api.requires_time()
            && !time_mapped
        {
            let now = format_timestamp(self.clock.now());
            debug!("Synthesized '{}' = {} for mapping '{}'", self.config.time_field, now, mapping.id);
            ctx.add_value(
                self.config.time_field.as_str(),
                SubstituteValue::text(now, RepairStrategy::CreateIfMissing),
            );
        }
    }

    fn classify(&self, sub: &Substitution, value: Value) -> Vec<SubstituteValue> {
        let strategy = sub.repair_strategy;
        match value {
            Value::Null => vec![SubstituteValue::ignore(strategy)],
            Value::Array(items) if sub.expand_array => self.expand(sub, items),
            Value::Array(mut items) => {
                let picked = match strategy {
                    RepairStrategy::UseFirstValueOfArray => {
                        Some(if items.is_empty() { Value::Null } else { items.swap_remove(0) })
                    }
                    RepairStrategy::UseLastValueOfArray => Some(items.pop().unwrap_or(Value::Null)),
                    _ => None,
                };
                let value = picked.unwrap_or(Value::Array(items));
                vec![SubstituteValue::classify(value, strategy, false)]
            }
            other => vec![SubstituteValue::classify(other, strategy, false)],
        }
    }

    fn expand(&self, sub: &Substitution, items: Vec<Value>) -> Vec<SubstituteValue> {
        let total = items.len();
        let limit = self.config.max_expanded_elements;
        let mut out = Vec::with_capacity(total.min(limit));

        for item in items {
            match item {
                Value::String(_) | Value::Number(_) => {
                    if out.len() == limit {
                        warn!(
                            "Expanded array of '{}' truncated to {} of {} elements",
                            sub.path_source, limit, total
                        );
                        break;
                    }
                    out.push(SubstituteValue::classify(item, sub.repair_strategy, true));
                }
                other => warn!(
                    "Dropping non-scalar element {} of expanded array '{}'",
                    other, sub.path_source
                ),
            }
        }
        out
    }
}
