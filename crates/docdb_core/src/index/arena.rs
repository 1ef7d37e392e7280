//! Node persistence with a decoded-node cache.

use super::node::{Node, RootPointer, ROOT_KEY};
use crate::error::{CoreError, CoreResult};
use crate::storage::{Cache, CachePolicy};
use docdb_storage::{is_internal_key, BlobStore};

/// Loads and stores the nodes of one B-tree.
///
/// Every write goes straight to the blob store and drops the cached copy,
/// so the cache never holds a node newer or older than disk.
pub struct NodeArena {
    store: Box<dyn BlobStore>,
    cache: Cache<String, Node>,
    label: String,
}

impl NodeArena {
    /// Creates an arena over `store`, caching up to `cache_capacity` nodes.
    pub fn new(store: Box<dyn BlobStore>, cache_capacity: usize, label: impl Into<String>) -> Self {
        Self {
            store,
            cache: Cache::new(cache_capacity, CachePolicy::Lru),
            label: label.into(),
        }
    }

    /// A fresh node id.
    #[must_use]
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Loads a node. A dangling id is corruption.
    pub fn get(&mut self, id: &str) -> CoreResult<Node> {
        let key = id.to_string();
        if let Some(node) = self.cache.get(&key) {
            return Ok(node);
        }
        let bytes = self.store.get(id)?.ok_or_else(|| {
            CoreError::corrupted(
                format!("index {}", self.label),
                format!("node {id} is referenced but missing"),
            )
        })?;
        let node: Node = serde_json::from_slice(&bytes).map_err(|e| {
            CoreError::corrupted(format!("index {} node {id}", self.label), e.to_string())
        })?;
        self.cache.insert(key, node.clone());
        Ok(node)
    }

    /// Writes a node.
    pub fn put(&mut self, node: &Node) -> CoreResult<()> {
        let bytes = serde_json::to_vec(node)?;
        self.store.put(&node.id, &bytes)?;
        self.cache.remove(&node.id);
        Ok(())
    }

    /// Deletes a node.
    pub fn remove(&mut self, id: &str) -> CoreResult<()> {
        self.cache.remove(&id.to_string());
        match self.store.delete(id) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the root pointer, if the tree was ever initialized.
    pub fn load_root(&self) -> CoreResult<Option<String>> {
        let Some(bytes) = self.store.get(ROOT_KEY)? else {
            return Ok(None);
        };
        let pointer: RootPointer = serde_json::from_slice(&bytes).map_err(|e| {
            CoreError::corrupted(format!("index {} root pointer", self.label), e.to_string())
        })?;
        Ok(Some(pointer.root_id))
    }

    /// Persists the root pointer.
    pub fn save_root(&mut self, root_id: &str) -> CoreResult<()> {
        let bytes = serde_json::to_vec(&RootPointer {
            root_id: root_id.to_string(),
        })?;
        self.store.put(ROOT_KEY, &bytes)?;
        Ok(())
    }

    /// Number of node blobs on disk.
    pub fn node_count(&self) -> CoreResult<usize> {
        let mut count = 0;
        for key in self.store.keys()? {
            if !is_internal_key(&key?) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Removes every node and the root pointer.
    pub fn clear(&mut self) -> CoreResult<()> {
        self.cache.clear();
        self.store.clear()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexKey;
    use docdb_storage::MemoryBlobStore;

    #[test]
    fn put_get_round_trip_through_cache() {
        let mut arena = NodeArena::new(Box::new(MemoryBlobStore::new()), 4, "test");
        let mut node = Node::leaf(NodeArena::new_id());
        node.keys.push(IndexKey::from("k"));
        node.values.push(vec!["doc".into()]);
        arena.put(&node).unwrap();

        assert_eq!(arena.get(&node.id).unwrap(), node);
        // Second read is served from cache.
        assert_eq!(arena.get(&node.id).unwrap(), node);

        node.values[0].push("other".into());
        arena.put(&node).unwrap();
        assert_eq!(arena.get(&node.id).unwrap().values[0].len(), 2);
    }

    #[test]
    fn missing_node_is_corruption() {
        let mut arena = NodeArena::new(Box::new(MemoryBlobStore::new()), 4, "test");
        assert!(matches!(arena.get("nope"), Err(CoreError::Corrupted { .. })));
    }

    #[test]
    fn root_pointer_and_count() {
        let mut arena = NodeArena::new(Box::new(MemoryBlobStore::new()), 0, "test");
        assert_eq!(arena.load_root().unwrap(), None);
        let node = Node::leaf(NodeArena::new_id());
        arena.put(&node).unwrap();
        arena.save_root(&node.id).unwrap();

        assert_eq!(arena.load_root().unwrap(), Some(node.id.clone()));
        assert_eq!(arena.node_count().unwrap(), 1);

        arena.clear().unwrap();
        assert_eq!(arena.load_root().unwrap(), None);
        assert_eq!(arena.node_count().unwrap(), 0);
    }
}
