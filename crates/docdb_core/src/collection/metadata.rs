//! Aggregate per-collection state persisted in `_metadata.json`.

use crate::error::{CoreError, CoreResult};
use crate::storage::StorageManager;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Blob key of the metadata file.
pub const METADATA_KEY: &str = "_metadata";

/// Derived aggregate state of a collection.
///
/// Everything here can be rebuilt from the document files: the count is
/// reconciled against disk on open, and `needs_reindex` forces every index
/// to be rebuilt after recovery touched the collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectionMetadata {
    /// Number of stored documents.
    pub document_count: u64,
    /// Canonical names of the indexes built on disk.
    pub indexes: BTreeSet<String>,
    /// Time of the last mutation, in milliseconds since the epoch.
    pub last_modified: u64,
    /// Next id handed out by an auto-increment primary key.
    pub next_auto_id: u64,
    /// Set by recovery when documents changed behind the indexes' back.
    pub needs_reindex: bool,
}

impl CollectionMetadata {
    /// Loads the metadata of a collection, or defaults for a new one.
    pub fn load(storage: &StorageManager) -> CoreResult<Self> {
        Ok(storage.load_internal(METADATA_KEY)?.unwrap_or_default())
    }

    /// Persists the metadata.
    pub fn save(&self, storage: &StorageManager) -> CoreResult<()> {
        storage.save_internal(METADATA_KEY, self)
    }

    /// Hands out the next auto-increment id.
    ///
    /// # Errors
    ///
    /// Returns a validation error once the counter has reached `u64::MAX`.
    pub fn take_auto_id(&mut self) -> CoreResult<u64> {
        let id = self.next_auto_id.max(1);
        self.next_auto_id = id
            .checked_add(1)
            .ok_or_else(|| CoreError::validation("auto id space exhausted"))?;
        Ok(id)
    }

    /// Keeps the counter ahead of an id the caller supplied.
    pub fn observe_id(&mut self, id: &str) {
        if let Ok(n) = id.parse::<u64>() {
            if n >= self.next_auto_id {
                self.next_auto_id = n.saturating_add(1);
            }
        }
    }
}
