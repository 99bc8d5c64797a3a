//! Core types for dynmap.
//!
//! This crate holds everything that does not touch a single message:
//! the mapping model, its validation, topic and target-path grammar and the topic-indexed
//! mapping tree. The per-message pipeline lives in `dynmap-engine`.

pub mod config;
pub mod error;
pub mod logging;
pub mod mapping;
pub mod target;
pub mod topic;
pub mod tree;
pub mod validation;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use mapping::{
    Api, Direction, Mapping, MappingType, Qos, RepairStrategy, Substitution, mappings_from_json,
};
pub use tree::{MappingTree, MappingTreeNode, NodeId, NodeKind};
pub use validation::{ValidationError, validate_mapping};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{EngineConfig, fields};
    pub use crate::error::{Error, Result};
    pub use crate::mapping::{
        Api, Direction, Mapping, MappingType, RepairStrategy, Substitution,
    };
    pub use crate::topic::{tokenize_for_payload, tokenize_for_tree, topic_matches};
    pub use crate::tree::MappingTree;
    pub use crate::validation::{ValidationError, validate_mapping};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
