//! Database directory management.
//!
//! ```text
//! <db_path>/
//! ├─ LOCK                    # Advisory lock for single-process ownership
//! ├─ _wal/segment-{n}.log    # Write-ahead log segments
//! └─ <collection>/
//!    ├─ <encodedId>.json     # One file per document
//!    ├─ _metadata.json       # Aggregate state
//!    └─ _indexes/<fields>/   # One B-tree per secondary index
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
/// Directory holding WAL segments.
pub const WAL_DIR: &str = "_wal";

/// Manages the database directory structure and file locking.
///
/// The `DatabaseDir` holds an exclusive lock on the directory for as long as
/// it lives; a second open, from this or another process, fails with
/// [`CoreError::DatabaseLocked`].
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another handle holds the lock (returns `DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_operation(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the WAL segment directory.
    #[must_use]
    pub fn wal_dir(&self) -> PathBuf {
        self.path.join(WAL_DIR)
    }

    /// Returns the directory of a collection, validating its name.
    ///
    /// # Errors
    ///
    /// Returns a validation error for names that are empty, contain path
    /// separators or start with `_` or `.`.
    pub fn collection_dir(&self, name: &str) -> CoreResult<PathBuf> {
        validate_collection_name(name)?;
        Ok(self.path.join(name))
    }

    /// Lists collections that exist on disk, sorted by name.
    pub fn collection_names(&self) -> CoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_collection_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Fsyncs the database directory so created or removed entries survive a crash.
    #[cfg(unix)]
    pub fn sync(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    /// Windows NTFS journals directory metadata; nothing to do.
    #[cfg(not(unix))]
    pub fn sync(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Checks that `name` can be used as a collection directory.
pub fn validate_collection_name(name: &str) -> CoreResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('_')
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::validation(format!("invalid collection name {name:?}")))
    }
}

/// Removes a directory tree, treating absence as success.
pub(crate) fn remove_dir_if_exists(path: &Path) -> CoreResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
