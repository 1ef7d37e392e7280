//! Error types for docdb core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in docdb core operations.
///
/// Validation and not-found errors are recoverable and reach the caller
/// unchanged. A [`CoreError::WalWrite`] or [`CoreError::Timeout`] on a write
/// path means the operation must not be considered committed.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A document or schema was rejected; nothing was changed.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong.
        message: String,
    },

    /// No document with this id exists.
    #[error("document {id:?} not found in collection {collection}")]
    NotFound {
        /// Collection searched.
        collection: String,
        /// The missing id.
        id: String,
    },

    /// Optimistic versioning collision on update.
    #[error("version conflict on {id:?}: expected version {expected}, found {actual}")]
    VersionConflict {
        /// Document id.
        id: String,
        /// Version the caller based its update on.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// Disk read, write or rename failure. Carries the path and cause.
    #[error("storage error: {0}")]
    Storage(#[from] docdb_storage::StorageError),

    /// I/O error outside a blob store (directories, lock file).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Appending to the WAL failed; the operation is not durable.
    #[error("WAL write failed: {message}")]
    WalWrite {
        /// Description of the failure.
        message: String,
    },

    /// The WAL could not be read during recovery.
    #[error("WAL replay failed: {message}")]
    WalReplay {
        /// Description of the failure.
        message: String,
    },

    /// Deleting checkpointed WAL segments failed.
    #[error("WAL checkpoint failed: {message}")]
    WalCheckpoint {
        /// Description of the failure.
        message: String,
    },

    /// A unique index already maps this key to another document.
    #[error("unique index {index} already contains key {key} (held by {existing:?})")]
    Index {
        /// Canonical index name.
        index: String,
        /// Rendered key.
        key: String,
        /// Id of the document already holding the key.
        existing: String,
    },

    /// The operation did not finish before its deadline.
    ///
    /// A timed-out write is **not** committed, but its on-disk effect is
    /// undefined; re-read before assuming either outcome.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted structure could not be decoded.
    #[error("corrupted data at {location}: {message}")]
    Corrupted {
        /// Where the corruption was found.
        location: String,
        /// Description of the corruption.
        message: String,
    },

    /// Another process holds the database lock.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Creates a WAL write error.
    pub fn wal_write(message: impl Into<String>) -> Self {
        Self::WalWrite {
            message: message.into(),
        }
    }

    /// Creates a WAL replay error.
    pub fn wal_replay(message: impl Into<String>) -> Self {
        Self::WalReplay {
            message: message.into(),
        }
    }

    /// Creates a WAL checkpoint error.
    pub fn wal_checkpoint(message: impl Into<String>) -> Self {
        Self::WalCheckpoint {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupted {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for errors that leave state unchanged and can be
    /// reported straight back to the caller.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::NotFound { .. }
                | Self::VersionConflict { .. }
                | Self::Index { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_document() {
        let err = CoreError::not_found("users", "u1");
        assert_eq!(
            err.to_string(),
            "document \"u1\" not found in collection users"
        );

        let err = CoreError::VersionConflict {
            id: "u1".into(),
            expected: 2,
            actual: 3,
        };
        assert!(err.to_string().contains("expected version 2"));
    }

    #[test]
    fn recoverable_classification() {
        assert!(CoreError::validation("bad").is_recoverable());
        assert!(CoreError::not_found("c", "i").is_recoverable());
        assert!(!CoreError::wal_write("disk full").is_recoverable());
        assert!(!CoreError::Timeout { operation: "delete" }.is_recoverable());
    }

    #[test]
    fn storage_errors_convert() {
        let err: CoreError = docdb_storage::StorageError::NotFound { key: "k".into() }.into();
        assert!(matches!(err, CoreError::Storage(_)));
    }
}
