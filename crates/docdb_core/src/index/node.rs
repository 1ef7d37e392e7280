//! On-disk B-tree node layout.

use super::key::IndexKey;
use serde::{Deserialize, Serialize};

/// Blob key holding the [`RootPointer`] of a tree.
pub const ROOT_KEY: &str = "_root";

/// A B-tree node as persisted, one blob per node.
///
/// `values[i]` lists the document ids stored under `keys[i]`. Internal nodes
/// have exactly `keys.len() + 1` children; leaves have none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Node id; also its blob key.
    pub id: String,
    /// Whether the node has no children.
    pub is_leaf: bool,
    /// Keys in strictly ascending order.
    pub keys: Vec<IndexKey>,
    /// Document ids per key, never empty.
    pub values: Vec<Vec<String>>,
    /// Child node ids.
    pub children: Vec<String>,
}

impl Node {
    /// An empty leaf.
    #[must_use]
    pub fn leaf(id: String) -> Self {
        Self {
            id,
            is_leaf: true,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    /// An internal node with no keys yet.
    #[must_use]
    pub fn internal(id: String, children: Vec<String>) -> Self {
        Self {
            id,
            is_leaf: false,
            keys: Vec::new(),
            values: Vec::new(),
            children,
        }
    }

    /// Index of the first key not less than `key`, and whether it is equal.
    #[must_use]
    pub fn search(&self, key: &IndexKey) -> (usize, bool) {
        let pos = self.keys.partition_point(|k| k < key);
        (pos, self.keys.get(pos) == Some(key))
    }
}

/// Persisted pointer to the current root node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootPointer {
    /// Id of the root node.
    pub root_id: String,
}
