//! Secondary indexes backed by persistent B-trees.
//!
//! - [`IndexKey`]: totally ordered key extracted from document fields
//! - [`BTree`]: the disk-resident tree, one blob per node
//! - [`SecondaryIndex`]: a schema index definition bound to its tree

mod arena;
mod key;
mod node;
mod secondary;
mod tree;

pub use arena::NodeArena;
pub use key::{document_keys, value_keys, IndexKey};
pub use node::{Node, RootPointer, ROOT_KEY};
pub use secondary::{IndexOptions, SecondaryIndex, INDEXES_DIR};
pub use tree::{BTree, Bound, TreeShape};
