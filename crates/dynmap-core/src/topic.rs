//! Topic tokenization and wildcard grammar.
//!
//! Topics are `/`-separated levels. `+` matches exactly one level, `#` matches
//! one or more trailing levels and is only valid as the last level.

use thiserror::Error;

/// Level separator.
pub const SEPARATOR: char = '/';
/// Single-level wildcard.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
/// Multi-level wildcard.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Wildcard grammar violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("topic '{0}' contains more than one '+' wildcard")]
    MultipleSingleLevelWildcards(String),
    #[error("topic '{0}' contains more than one '#' wildcard")]
    MultipleMultiLevelWildcards(String),
    #[error("topic '{0}': '#' must be the last level")]
    MultiLevelWildcardNotLast(String),
    #[error("topic '{topic}': wildcard inside level '{level}'")]
    WildcardInsideLevel { topic: String, level: String },
}

/// Trim whitespace and collapse runs of leading/trailing separators to one.
fn normalize(topic: &str) -> String {
    let trimmed = topic.trim();
    let body = trimmed.trim_matches(SEPARATOR);
    let leading = trimmed.starts_with(SEPARATOR);
    let trailing = trimmed.ends_with(SEPARATOR) && !body.is_empty();

    let mut out = String::with_capacity(trimmed.len());
    if leading {
        out.push(SEPARATOR);
    }
    out.push_str(body);
    if trailing {
        out.push(SEPARATOR);
    }
    out
}

/// Split a topic into levels for tree insertion and lookup.
///
/// A leading separator yields a leading empty level (`/a` and `a` are distinct
/// topics), a trailing separator is dropped. The empty topic yields `[""]`.
pub fn tokenize_for_tree(topic: &str) -> Vec<String> {
    let normalized = normalize(topic);
    let without_trailing = if normalized.len() > 1 {
        normalized.strip_suffix(SEPARATOR).unwrap_or(&normalized)
    } else {
        normalized.as_str()
    };
    if without_trailing == "/" {
        return vec![String::new(), String::new()];
    }
    without_trailing.split(SEPARATOR).map(str::to_string).collect()
}

/// Split a topic into levels that are injected into a payload as data.
///
/// Unlike [`tokenize_for_tree`] a leading empty level is dropped, so
/// `_TOPIC_LEVEL_[0]` always addresses the first named level.
pub fn tokenize_for_payload(topic: &str) -> Vec<String> {
    let mut levels = tokenize_for_tree(topic);
    if levels.len() > 1 && levels[0].is_empty() {
        levels.remove(0);
    }
    levels
}

/// Split a topic keeping separators as positional tokens.
///
/// `/a/b` becomes `["/", "a", "/", "b"]`; joining the tokens yields the
/// normalized topic again.
pub fn tokenize_with_separators(topic: &str) -> Vec<String> {
    let normalized = normalize(topic);
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in normalized.chars() {
        if c == SEPARATOR {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            tokens.push(SEPARATOR.to_string());
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Whether a level is a wildcard token.
pub fn is_wildcard(level: &str) -> bool {
    level == SINGLE_LEVEL_WILDCARD || level == MULTI_LEVEL_WILDCARD
}

/// Check the wildcard grammar of a subscription topic.
pub fn validate_wildcards(topic: &str) -> Result<(), TopicError> {
    if topic.trim().is_empty() {
        return Err(TopicError::Empty);
    }
    let levels = tokenize_for_tree(topic);

    for level in &levels {
        if level.len() > 1 && (level.contains('+') || level.contains('#')) {
            return Err(TopicError::WildcardInsideLevel {
                topic: topic.to_string(),
                level: level.clone(),
            });
        }
    }

    let single = levels.iter().filter(|l| *l == SINGLE_LEVEL_WILDCARD).count();
    if single > 1 {
        return Err(TopicError::MultipleSingleLevelWildcards(topic.to_string()));
    }

    let multi: Vec<usize> = levels
        .iter()
        .enumerate()
        .filter(|(_, l)| *l == MULTI_LEVEL_WILDCARD)
        .map(|(i, _)| i)
        .collect();
    if multi.len() > 1 {
        return Err(TopicError::MultipleMultiLevelWildcards(topic.to_string()));
    }
    if let Some(&pos) = multi.first() {
        if pos + 1 != levels.len() {
            return Err(TopicError::MultiLevelWildcardNotLast(topic.to_string()));
        }
    }
    Ok(())
}

/// Match a concrete topic against a wildcard pattern.
///
/// Wildcards in `topic` are compared literally, so a template topic that
/// repeats the pattern's wildcards at the same positions also matches.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern = tokenize_for_tree(pattern);
    let topic = tokenize_for_tree(topic);

    let mut i = 0;
    while i < pattern.len() {
        let level = pattern[i].as_str();
        if level == MULTI_LEVEL_WILDCARD {
            return topic.len() > i;
        }
        let Some(actual) = topic.get(i) else {
            return false;
        };
        if level != SINGLE_LEVEL_WILDCARD && level != actual {
            return false;
        }
        i += 1;
    }
    topic.len() == pattern.len()
}
