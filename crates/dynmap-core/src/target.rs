//! Target path grammar.
//!
//! Target paths are dot paths with optional `[n]` indices
//! (`c8y_Temperature.T.value`, `_TOPIC_LEVEL_[2]`). `$` denotes the root.

use thiserror::Error;

/// Root notation shared by source expressions and target paths.
pub const ROOT: &str = "$";

/// Largest array index a target path may address.
pub const MAX_INDEX: usize = 10_000;

/// Malformed target path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("path is empty")]
    Empty,
    #[error("invalid segment '{segment}' in path '{path}'")]
    InvalidSegment { path: String, segment: String },
    #[error("index {index} in path '{path}' exceeds {}", MAX_INDEX)]
    IndexTooLarge { path: String, index: String },
}

/// One step of a target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Parse a dot path. `$` parses to no segments, meaning the root.
pub fn parse_target(path: &str) -> Result<Vec<Segment>, TargetError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(TargetError::Empty);
    }
    if trimmed == ROOT {
        return Ok(Vec::new());
    }

    let invalid = |segment: &str| TargetError::InvalidSegment {
        path: trimmed.to_string(),
        segment: segment.to_string(),
    };

    let mut segments = Vec::new();
    for part in trimmed.split('.') {
        if part.is_empty() {
            return Err(invalid(part));
        }
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(Segment::Key(key.to_string()));
        } else if rest.is_empty() {
            return Err(invalid(part));
        }
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| invalid(part))?;
            if !rest.starts_with('[') {
                return Err(invalid(part));
            }
            let digits = rest[1..close].trim();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid(part));
            }
            let index = digits
                .parse::<usize>()
                .ok()
                .filter(|i| *i <= MAX_INDEX)
                .ok_or_else(|| TargetError::IndexTooLarge {
                    path: trimmed.to_string(),
                    index: digits.to_string(),
                })?;
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
        }
    }
    Ok(segments)
}

/// Render segments back into dot notation.
pub fn describe(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
            Segment::Index(i) => out.push_str(&format!("[{}]", i)),
        }
    }
    if out.is_empty() {
        out.push_str(ROOT);
    }
    out
}
