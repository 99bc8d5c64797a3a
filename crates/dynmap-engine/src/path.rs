//! Source expressions and target paths.
//!
//! Source expressions select values from the augmented payload:
//! a leading `/` is a JSON pointer, `$` is the whole payload and anything
//! else is a JMESPath expression. Target paths are dot paths with optional
//! `[n]` indices (`c8y_Temperature.T.value`, `_TOPIC_LEVEL_[2]`).

use dynmap_core::target::{self, describe, TargetError};
use serde_json::{Map, Value};
use thiserror::Error;

pub use dynmap_core::target::{Segment, MAX_INDEX, ROOT};

/// Path evaluation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("expression '{expr}' failed: {reason}")]
    Expression { expr: String, reason: String },
    #[error("'{0}' does not exist in the template")]
    Missing(String),
    #[error("'{0}' is not an object")]
    NotAnObject(String),
    #[error("'{0}' is not an array")]
    NotAnArray(String),
    #[error("index {index} is out of range at '{path}'")]
    IndexOutOfRange { path: String, index: usize },
    #[error("'{0}' can only be created at the root level")]
    NestedCreate(String),
}

impl From<PathError> for dynmap_core::Error {
    fn from(e: PathError) -> Self {
        match e {
            PathError::Expression { .. } => dynmap_core::Error::Extraction(e.to_string()),
            _ => dynmap_core::Error::Assembly(e.to_string()),
        }
    }
}

// ============================================================================
// Source expressions
// ============================================================================

/// A compiled source expression.
pub enum SourceExpression {
    Root,
    Pointer(String),
    JmesPath(jmespath::Expression<'static>),
}

impl SourceExpression {
    pub fn compile(expr: &str) -> Result<Self, PathError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        if trimmed == ROOT {
            return Ok(SourceExpression::Root);
        }
        if trimmed.starts_with('/') {
            return Ok(SourceExpression::Pointer(trimmed.to_string()));
        }
        jmespath::compile(trimmed)
            .map(SourceExpression::JmesPath)
            .map_err(|e| PathError::Expression {
                expr: trimmed.to_string(),
                reason: e.to_string(),
            })
    }

    /// Evaluate against a payload. Absent values are `Value::Null`.
    pub fn evaluate(&self, payload: &Value) -> Result<Value, PathError> {
        match self {
            SourceExpression::Root => Ok(payload.clone()),
            SourceExpression::Pointer(pointer) => {
                Ok(payload.pointer(pointer).cloned().unwrap_or(Value::Null))
            }
            SourceExpression::JmesPath(expr) => {
                let result = expr.search(payload).map_err(|e| PathError::Expression {
                    expr: expr.as_str().to_string(),
                    reason: e.to_string(),
                })?;
                serde_json::to_value(result.as_ref()).map_err(|e| PathError::Expression {
                    expr: expr.as_str().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for SourceExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceExpression::Root => write!(f, "Root"),
            SourceExpression::Pointer(p) => write!(f, "Pointer({})", p),
            SourceExpression::JmesPath(e) => write!(f, "JmesPath({})", e.as_str()),
        }
    }
}

/// Compile and evaluate a source expression in one step.
pub fn evaluate_source(expr: &str, payload: &Value) -> Result<Value, PathError> {
    SourceExpression::compile(expr)?.evaluate(payload)
}

/// JMESPath truthiness: null, false and empty strings, arrays and objects are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

/// Evaluate a filter expression.
pub fn evaluate_filter(expr: &str, payload: &Value) -> Result<bool, PathError> {
    evaluate_source(expr, payload).map(|v| is_truthy(&v))
}

// ============================================================================
// Target paths
// ============================================================================

/// Parse a target path.
pub fn parse_target(path: &str) -> Result<Vec<Segment>, PathError> {
    Ok(target::parse_target(path)?)
}

/// Look up a node.
pub fn get<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |current, segment| match segment {
        Segment::Key(k) => current.as_object()?.get(k),
        Segment::Index(i) => current.as_array()?.get(*i),
    })
}

fn empty_container(next: &Segment) -> Value {
    match next {
        Segment::Key(_) => Value::Object(Map::new()),
        Segment::Index(_) => Value::Array(Vec::new()),
    }
}

/// Grow `array` so that `index` is addressable.
fn grow(array: &mut Vec<Value>, index: usize, path: &[Segment]) -> Result<(), PathError> {
    let len = index
        .checked_add(1)
        .filter(|len| *len <= MAX_INDEX + 1)
        .ok_or_else(|| PathError::IndexOutOfRange {
            path: describe(path),
            index,
        })?;
    if len > array.len() {
        array.resize(len, Value::Null);
    }
    Ok(())
}

/// Write a node.
///
/// Without `create` every segment must already exist, the last one included.
/// With `create` missing objects, arrays and array slots are created on the
/// way down.
pub fn set(root: &mut Value, segments: &[Segment], value: Value, create: bool) -> Result<(), PathError> {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut current = root;
    for (depth, segment) in parents.iter().enumerate() {
        let here = &segments[..=depth];
        let next = &segments[depth + 1];
        current = match segment {
            Segment::Key(k) => {
                let object = current
                    .as_object_mut()
                    .ok_or_else(|| PathError::NotAnObject(describe(&segments[..depth])))?;
                if !object.contains_key(k) {
                    if !create {
                        return Err(PathError::Missing(describe(here)));
                    }
                    object.insert(k.clone(), empty_container(next));
                }
                object
                    .get_mut(k)
                    .ok_or_else(|| PathError::Missing(describe(here)))?
            }
            Segment::Index(i) => {
                let array = current
                    .as_array_mut()
                    .ok_or_else(|| PathError::NotAnArray(describe(&segments[..depth])))?;
                if *i >= array.len() {
                    if !create {
                        return Err(PathError::IndexOutOfRange {
                            path: describe(here),
                            index: *i,
                        });
                    }
                    grow(array, *i, here)?;
                }
                if array[*i].is_null() {
                    array[*i] = empty_container(next);
                }
                &mut array[*i]
            }
        };
    }

    match last {
        Segment::Key(k) => {
            let object = current
                .as_object_mut()
                .ok_or_else(|| PathError::NotAnObject(describe(parents)))?;
            if !create && !object.contains_key(k) {
                return Err(PathError::Missing(describe(segments)));
            }
            object.insert(k.clone(), value);
        }
        Segment::Index(i) => {
            let array = current
                .as_array_mut()
                .ok_or_else(|| PathError::NotAnArray(describe(parents)))?;
            if *i >= array.len() {
                if !create {
                    return Err(PathError::IndexOutOfRange {
                        path: describe(segments),
                        index: *i,
                    });
                }
                grow(array, *i, segments)?;
            }
            array[*i] = value;
        }
    }
    Ok(())
}

/// Remove a node, returning it if it existed.
///
/// Removing an array element shifts the following elements.
pub fn remove(root: &mut Value, segments: &[Segment]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    let mut current = root;
    for segment in parents {
        current = match segment {
            Segment::Key(k) => current.as_object_mut()?.get_mut(k)?,
            Segment::Index(i) => current.as_array_mut()?.get_mut(*i)?,
        };
    }
    match last {
        Segment::Key(k) => current.as_object_mut()?.shift_remove(k),
        Segment::Index(i) => {
            let array = current.as_array_mut()?;
            if *i < array.len() {
                Some(array.remove(*i))
            } else {
                None
            }
        }
    }
}

/// Merge the keys of `value` into the root object.
pub fn merge_into_root(root: &mut Value, value: Value) -> Result<(), PathError> {
    let Value::Object(fields) = value else {
        return Err(PathError::NotAnObject(format!("value for '{}'", ROOT)));
    };
    let target = root
        .as_object_mut()
        .ok_or_else(|| PathError::NotAnObject(ROOT.to_string()))?;
    for (k, v) in fields {
        target.insert(k, v);
    }
    Ok(())
}
