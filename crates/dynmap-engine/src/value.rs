//! Values extracted for one substitution of one message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use dynmap_core::RepairStrategy;

/// JSON type class of an extracted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueKind {
    Textual,
    Number,
    Object,
    Array,
    /// Nothing was extracted.
    Ignore,
}

/// Result of evaluating one substitution against one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstituteValue {
    pub value: Value,
    pub kind: ValueKind,
    pub repair_strategy: RepairStrategy,
    pub expand_array: bool,
}

impl SubstituteValue {
    /// Classify a JSON value. Booleans are written verbatim like objects.
    pub fn classify(value: Value, repair_strategy: RepairStrategy, expand_array: bool) -> Self {
        let kind = match &value {
            Value::Null => ValueKind::Ignore,
            Value::String(_) => ValueKind::Textual,
            Value::Number(_) => ValueKind::Number,
            Value::Array(_) => ValueKind::Array,
            Value::Bool(_) | Value::Object(_) => ValueKind::Object,
        };
        Self {
            value,
            kind,
            repair_strategy,
            expand_array,
        }
    }

    pub fn ignore(repair_strategy: RepairStrategy) -> Self {
        Self {
            value: Value::Null,
            kind: ValueKind::Ignore,
            repair_strategy,
            expand_array: false,
        }
    }

    pub fn text(text: impl Into<String>, repair_strategy: RepairStrategy) -> Self {
        Self::classify(Value::String(text.into()), repair_strategy, false)
    }

    pub fn is_missing(&self) -> bool {
        self.kind == ValueKind::Ignore || self.value.is_null()
    }

    /// Identifier form of the value: strings unquoted, numbers as written.
    pub fn as_identifier(&self) -> Option<String> {
        match &self.value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Value written into a target payload.
    ///
    /// Textual values that look numeric become numbers when the template node
    /// they replace is a number; anything else is written as extracted.
    pub fn materialize(&self, template_node: Option<&Value>) -> Value {
        match (&self.kind, &self.value, template_node) {
            (ValueKind::Textual, Value::String(text), Some(Value::Number(_))) => {
                coerce_number(text).unwrap_or_else(|| self.value.clone())
            }
            _ => self.value.clone(),
        }
    }
}

/// Parse text as an integer, then as a float.
pub fn coerce_number(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Value::from(i));
    }
    if let Ok(u) = trimmed.parse::<u64>() {
        return Some(Value::from(u));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}
