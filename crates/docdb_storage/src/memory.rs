//! In-memory blob store for testing.

use crate::blob::{is_internal_key, validate_key, BlobStore, KeyIter};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory blob store.
///
/// Suitable for unit tests and for trees that do not need to survive a
/// restart. Values are copied in and out, so callers never share buffers
/// with the store.
///
/// # Example
///
/// ```rust
/// use docdb_storage::{BlobStore, MemoryBlobStore};
///
/// let store = MemoryBlobStore::new();
/// store.put("k", b"v").unwrap();
/// assert!(store.contains("k").unwrap());
/// ```
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored values, internal keys included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        self.data.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        match self.data.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    fn contains(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.data.read().contains_key(key))
    }

    fn keys(&self) -> StorageResult<KeyIter> {
        // Snapshot so the iterator does not hold the lock.
        let keys: Vec<String> = self
            .data
            .read()
            .keys()
            .filter(|k| !is_internal_key(k))
            .cloned()
            .collect();
        Ok(Box::new(keys.into_iter().map(Ok)))
    }

    fn clear(&self) -> StorageResult<()> {
        self.data.write().clear();
        Ok(())
    }
}
