//! Keyed blob store trait definition.

use crate::error::{StorageError, StorageResult};
use std::sync::Arc;

/// A lazily evaluated sequence of stored keys.
pub type KeyIter = Box<dyn Iterator<Item = StorageResult<String>> + Send>;

/// A store of opaque blobs addressed by string keys.
///
/// Blob stores are **opaque byte stores**. docdb owns every format decision;
/// a store only guarantees that `get` returns exactly the bytes of the last
/// successful `put` for the same key.
///
/// # Invariants
///
/// - `put` replaces a value atomically: a concurrent or crashed writer never
///   leaves a partially written value behind
/// - `delete` of a missing key fails with [`StorageError::NotFound`], never
///   with an I/O error
/// - keys starting with `_` are internal and are skipped by [`BlobStore::keys`]
/// - keys starting with `.` are reserved for temporary files and are rejected
///
/// # Implementors
///
/// - [`super::FileBlobStore`] - one file per key
/// - [`super::MemoryBlobStore`] - for tests
pub trait BlobStore: Send + Sync {
    /// Reads the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `data` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Removes the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if nothing is stored under `key`.
    fn delete(&self, key: &str) -> StorageResult<()>;

    /// Returns true if a value is stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn contains(&self, key: &str) -> StorageResult<bool>;

    /// Enumerates all non-internal keys.
    ///
    /// The sequence is produced lazily and may be restarted by calling
    /// `keys` again. Order is unspecified.
    ///
    /// # Errors
    ///
    /// Returns an error if the enumeration cannot be started.
    fn keys(&self) -> StorageResult<KeyIter>;

    /// Removes every value, internal keys included.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn clear(&self) -> StorageResult<()>;
}

impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        (**self).put(key, data)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        (**self).delete(key)
    }

    fn contains(&self, key: &str) -> StorageResult<bool> {
        (**self).contains(key)
    }

    fn keys(&self) -> StorageResult<KeyIter> {
        (**self).keys()
    }

    fn clear(&self) -> StorageResult<()> {
        (**self).clear()
    }
}

/// Returns true for keys reserved for internal bookkeeping.
#[must_use]
pub fn is_internal_key(key: &str) -> bool {
    key.starts_with('_')
}

pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    let reason = if key.is_empty() {
        "empty key"
    } else if key.starts_with('.') {
        "keys starting with '.' are reserved"
    } else if key.contains(['/', '\\', '\0']) {
        "key contains a path separator or NUL"
    } else {
        return Ok(());
    };
    Err(StorageError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}
