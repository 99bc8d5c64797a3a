//! Topic-indexed mapping tree.
//!
//! A multi-way trie keyed by topic level. Nodes live in an arena and refer to
//! their parent by index. Per level token a node holds either exactly one
//! inner node or one or more leaves, each leaf owning one mapping.
//!
//! ```text
//! root
//!  └─ "device" (inner)
//!      ├─ "+" (inner)
//!      │   └─ "temperature" → [leaf m1, leaf m2]
//!      └─ "#" → [leaf m3]
//! ```
//!
//! The tree is never mutated while it is being read: the engine builds a new
//! tree and publishes it by swapping an `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::mapping::Mapping;
use crate::resolve_err;
use crate::topic::{self, MULTI_LEVEL_WILDCARD, SINGLE_LEVEL_WILDCARD};

/// Index of a node in the tree arena.
pub type NodeId = usize;

/// Id of the root node.
pub const ROOT: NodeId = 0;

/// Node payload.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Structural node: level token → child ids.
    Inner {
        children: BTreeMap<String, Vec<NodeId>>,
    },
    /// Terminal node owning a mapping.
    Leaf { mapping: Arc<Mapping> },
}

/// A node of the mapping tree.
#[derive(Debug, Clone)]
pub struct MappingTreeNode {
    pub kind: NodeKind,
    /// Number of levels from the root.
    pub depth: usize,
    /// Absolute path, for diagnostics.
    pub path: String,
    pub parent: Option<NodeId>,
}

impl MappingTreeNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    pub fn mapping(&self) -> Option<&Arc<Mapping>> {
        match &self.kind {
            NodeKind::Leaf { mapping } => Some(mapping),
            NodeKind::Inner { .. } => None,
        }
    }
}

/// Mapping tree.
#[derive(Debug, Clone)]
pub struct MappingTree {
    nodes: Vec<MappingTreeNode>,
    leaf_count: usize,
}

impl Default for MappingTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingTree {
    /// Create a tree holding only the root.
    pub fn new() -> Self {
        Self {
            nodes: vec![MappingTreeNode {
                kind: NodeKind::Inner {
                    children: BTreeMap::new(),
                },
                depth: 0,
                path: String::new(),
                parent: None,
            }],
            leaf_count: 0,
        }
    }

    /// Build a tree, skipping mappings that conflict structurally.
    ///
    /// Returns the tree and the rejected mappings with the reason.
    pub fn build<I>(mappings: I) -> (Self, Vec<(String, Error)>)
    where
        I: IntoIterator<Item = Arc<Mapping>>,
    {
        let mut tree = Self::new();
        let mut rejected = Vec::new();
        for mapping in mappings {
            let id = mapping.id.clone();
            if let Err(e) = tree.insert(mapping) {
                warn!("Skipping mapping '{}': {}", id, e);
                rejected.push((id, e));
            }
        }
        (tree, rejected)
    }

    /// Number of mappings in the tree.
    pub fn len(&self) -> usize {
        self.leaf_count
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_count == 0
    }

    /// Access a node by id.
    pub fn node(&self, id: NodeId) -> Option<&MappingTreeNode> {
        self.nodes.get(id)
    }

    /// Parent of a node; `None` for the root.
    pub fn parent(&self, id: NodeId) -> Option<&MappingTreeNode> {
        self.nodes.get(id)?.parent.and_then(|p| self.nodes.get(p))
    }

    fn children(&self, id: NodeId) -> Option<&BTreeMap<String, Vec<NodeId>>> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Inner { children } => Some(children),
            NodeKind::Leaf { .. } => None,
        }
    }

    fn children_mut(&mut self, id: NodeId) -> Option<&mut BTreeMap<String, Vec<NodeId>>> {
        match &mut self.nodes.get_mut(id)?.kind {
            NodeKind::Inner { children } => Some(children),
            NodeKind::Leaf { .. } => None,
        }
    }

    fn push_node(&mut self, kind: NodeKind, parent: NodeId, level: &str, path: String) -> NodeId {
        let depth = self.nodes[parent].depth + 1;
        let id = self.nodes.len();
        self.nodes.push(MappingTreeNode {
            kind,
            depth,
            path,
            parent: Some(parent),
        });
        if let Some(children) = self.children_mut(parent) {
            children.entry(level.to_string()).or_default().push(id);
        }
        id
    }

    /// Insert a mapping under its template topic.
    ///
    /// Fails when the path is empty or when a non-final level is occupied by
    /// leaves only. A final level may hold leaves next to an inner node.
    /// A failed insert leaves the tree unchanged.
    pub fn insert(&mut self, mapping: Arc<Mapping>) -> Result<NodeId> {
        let levels = topic::tokenize_for_tree(mapping.effective_topic());
        if levels.iter().all(|l| l.is_empty()) {
            return Err(resolve_err!(
                "mapping '{}' has an empty topic path",
                mapping.id
            ));
        }

        // Validate the whole path before touching the arena.
        let mut current = Some(ROOT);
        for (index, level) in levels.iter().enumerate() {
            let last = index + 1 == levels.len();
            let path = levels[..=index].join("/");
            let Some(node) = current else {
                break;
            };
            let existing = self
                .children(node)
                .and_then(|c| c.get(level))
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            if last {
                if existing
                    .iter()
                    .filter_map(|id| self.nodes[*id].mapping())
                    .any(|m| m.id == mapping.id)
                {
                    return Err(resolve_err!(
                        "mapping '{}' is already registered at '{}'",
                        mapping.id,
                        path
                    ));
                }
                break;
            }
            let inner = existing.iter().copied().find(|id| !self.nodes[*id].is_leaf());
            if inner.is_none() && !existing.is_empty() {
                return Err(resolve_err!(
                    "mapping '{}': level '{}' is occupied by a mapping node",
                    mapping.id,
                    path
                ));
            }
            current = inner;
        }

        let mut current = ROOT;
        for (index, level) in levels.iter().enumerate() {
            let path = levels[..=index].join("/");
            if index + 1 == levels.len() {
                let id = self.push_node(
                    NodeKind::Leaf {
                        mapping: mapping.clone(),
                    },
                    current,
                    level,
                    path,
                );
                self.leaf_count += 1;
                debug!("Inserted mapping '{}' at '{}'", mapping.id, self.nodes[id].path);
                return Ok(id);
            }

            let existing = self
                .children(current)
                .and_then(|c| c.get(level))
                .and_then(|ids| ids.iter().copied().find(|id| !self.nodes[*id].is_leaf()));
            current = match existing {
                Some(id) => id,
                None => self.push_node(
                    NodeKind::Inner {
                        children: BTreeMap::new(),
                    },
                    current,
                    level,
                    path,
                ),
            };
        }

        Err(resolve_err!("mapping '{}' could not be inserted", mapping.id))
    }

    /// Resolve a concrete topic to all matching mappings.
    ///
    /// Branches are visited exact match first, then `+`, then `#`. A topic
    /// that ends on an inner node contributes nothing.
    pub fn resolve(&self, topic: &str) -> Vec<Arc<Mapping>> {
        let levels = topic::tokenize_for_tree(topic);
        let mut found = Vec::new();
        self.resolve_from(ROOT, &levels, 0, &mut found);
        trace!("Resolved topic '{}' to {} mapping(s)", topic, found.len());
        found
    }

    fn resolve_from(
        &self,
        node: NodeId,
        levels: &[String],
        index: usize,
        found: &mut Vec<Arc<Mapping>>,
    ) {
        let Some(children) = self.children(node) else {
            return;
        };
        let Some(level) = levels.get(index) else {
            return;
        };
        let last = index + 1 == levels.len();

        let mut keys = vec![level.as_str()];
        if level != SINGLE_LEVEL_WILDCARD {
            keys.push(SINGLE_LEVEL_WILDCARD);
        }

        for key in keys {
            let Some(ids) = children.get(key) else {
                continue;
            };
            for &id in ids {
                match &self.nodes[id].kind {
                    NodeKind::Leaf { mapping } if last => found.push(mapping.clone()),
                    NodeKind::Leaf { .. } => {}
                    NodeKind::Inner { .. } if !last => {
                        self.resolve_from(id, levels, index + 1, found)
                    }
                    NodeKind::Inner { .. } => {}
                }
            }
        }

        // '#' swallows the current level and everything after it.
        if let Some(ids) = children.get(MULTI_LEVEL_WILDCARD) {
            found.extend(ids.iter().filter_map(|&id| self.nodes[id].mapping().cloned()));
        }
    }

    /// Remove the leaf holding `mapping`. Inner ancestors are kept.
    ///
    /// Returns whether a leaf was removed.
    pub fn delete(&mut self, mapping: &Mapping) -> bool {
        let levels = topic::tokenize_for_tree(mapping.effective_topic());
        let Some((last, parents)) = levels.split_last() else {
            return false;
        };

        let mut current = ROOT;
        for level in parents {
            let next = self
                .children(current)
                .and_then(|c| c.get(level))
                .and_then(|ids| ids.iter().copied().find(|id| !self.nodes[*id].is_leaf()));
            match next {
                Some(id) => current = id,
                None => return false,
            }
        }

        let target = self.children(current).and_then(|c| c.get(last)).and_then(|ids| {
            ids.iter()
                .copied()
                .find(|id| self.nodes[*id].mapping().is_some_and(|m| m.id == mapping.id))
        });
        let Some(target) = target else {
            return false;
        };

        if let Some(children) = self.children_mut(current) {
            if let Some(ids) = children.get_mut(last) {
                ids.retain(|id| *id != target);
                if ids.is_empty() {
                    children.remove(last);
                }
            }
        }
        // The arena slot is orphaned; it is unreachable from the root.
        self.nodes[target].parent = None;
        self.leaf_count -= 1;
        debug!("Deleted mapping '{}' from '{}'", mapping.id, self.nodes[target].path);
        true
    }

    /// All mappings reachable from the root, in depth-first order.
    pub fn mappings(&self) -> Vec<Arc<Mapping>> {
        let mut out = Vec::with_capacity(self.leaf_count);
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            match &self.nodes[id].kind {
                NodeKind::Leaf { mapping } => out.push(mapping.clone()),
                NodeKind::Inner { children } => {
                    for ids in children.values().rev() {
                        stack.extend(ids.iter().rev());
                    }
                }
            }
        }
        out
    }
}
