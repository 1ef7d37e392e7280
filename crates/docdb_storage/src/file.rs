//! File-per-key blob store for persistent storage.

use crate::blob::{is_internal_key, validate_key, BlobStore, KeyIter};
use crate::error::{StorageError, StorageResult};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A blob store keeping one file per key inside a directory.
///
/// The value for key `k` lives in `{dir}/{k}.{extension}`.
///
/// # Durability
///
/// Writes never overwrite a file in place. The new value is written to a
/// temporary file in the same directory and renamed over the old one, so a
/// crash leaves either the old or the new value. With `sync_writes` enabled
/// the temporary file and the directory are fsynced as part of every write.
///
/// # Example
///
/// ```no_run
/// use docdb_storage::{BlobStore, FileBlobStore};
/// use std::path::Path;
///
/// let store = FileBlobStore::open(Path::new("users"), "json").unwrap();
/// store.put("alice", br#"{"id":"alice"}"#).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
    extension: String,
    sync_writes: bool,
}

impl FileBlobStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: &Path, extension: &str) -> StorageResult<Self> {
        fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            extension: extension.to_string(),
            sync_writes: true,
        })
    }

    /// Sets whether writes are fsynced before returning.
    #[must_use]
    pub fn sync_writes(mut self, value: bool) -> Self {
        self.sync_writes = value;
        self
    }

    /// Returns the directory backing this store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file path used for `key`.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{}", self.extension))
    }

    /// Removes the whole directory backing this store.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn destroy(&self) -> StorageResult<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&self.dir, e)),
        }
    }

    /// Fsyncs the directory so renames and unlinks are durable.
    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        let dir = File::open(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        dir.sync_all().map_err(|e| StorageError::io(&self.dir, e))
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        // NTFS journals metadata; directory handles cannot be fsynced.
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        let path = self.path_for(key);

        let mut temp =
            NamedTempFile::new_in(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        temp.write_all(data)
            .map_err(|e| StorageError::io(temp.path(), e))?;
        if self.sync_writes {
            temp.as_file()
                .sync_all()
                .map_err(|e| StorageError::io(temp.path(), e))?;
        }
        temp.persist(&path)
            .map_err(|e| StorageError::io(&path, e.error))?;

        if self.sync_writes {
            self.sync_directory()?;
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                if self.sync_writes {
                    self.sync_directory()?;
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn contains(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        let path = self.path_for(key);
        path.try_exists().map_err(|e| StorageError::io(path, e))
    }

    fn keys(&self) -> StorageResult<KeyIter> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        let dir = self.dir.clone();
        let suffix = format!(".{}", self.extension);

        let iter = entries.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(StorageError::io(&dir, e))),
            };
            let name = entry.file_name().into_string().ok()?;
            let key = name.strip_suffix(&suffix)?;
            if key.is_empty() || key.starts_with('.') || is_internal_key(key) {
                return None;
            }
            Some(Ok(key.to_string()))
        });
        Ok(Box::new(iter))
    }

    fn clear(&self) -> StorageResult<()> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        let suffix = format!(".{}", self.extension);
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.dir, e))?;
            let path = entry.path();
            let is_ours = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(&suffix));
            if is_ours && path.is_file() {
                fs::remove_file(&path).map_err(|e| StorageError::io(&path, e))?;
            }
        }
        if self.sync_writes {
            self.sync_directory()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> FileBlobStore {
        FileBlobStore::open(dir, "json").unwrap().sync_writes(false)
    }

    #[test]
    fn put_and_get() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store.put("alpha", b"hello").unwrap();
        assert_eq!(store.get("alpha").unwrap().as_deref(), Some(&b"hello"[..]));
        assert!(dir.path().join("alpha.json").exists());
    }

    #[test]
    fn get_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn put_replaces_value() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store.put("alpha", b"first").unwrap();
        store.put("alpha", b"second value").unwrap();
        assert_eq!(
            store.get("alpha").unwrap().as_deref(),
            Some(&b"second value"[..])
        );
    }

    #[test]
    fn put_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        for i in 0..5 {
            store.put("alpha", format!("v{i}").as_bytes()).unwrap();
        }
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["alpha.json".to_string()]);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let result = store.delete("ghost");
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store.put("alpha", b"x").unwrap();
        store.delete("alpha").unwrap();
        assert!(!store.contains("alpha").unwrap());
    }

    #[test]
    fn keys_skip_internal_and_foreign_files() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store.put("a", b"1").unwrap();
        store.put("b", b"2").unwrap();
        store.put("_metadata", b"{}").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        fs::create_dir(dir.path().join("_indexes")).unwrap();

        let mut keys: Vec<_> = store.keys().unwrap().map(Result::unwrap).collect();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn keys_is_restartable() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.put("a", b"1").unwrap();

        assert_eq!(store.keys().unwrap().count(), 1);
        assert_eq!(store.keys().unwrap().count(), 1);
    }

    #[test]
    fn clear_removes_everything_ours() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.put("a", b"1").unwrap();
        store.put("_root", b"2").unwrap();

        store.clear().unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert!(store.get("_root").unwrap().is_none());
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileBlobStore::open(dir.path(), "json").unwrap();
            store.put("alpha", b"durable").unwrap();
        }
        let store = FileBlobStore::open(dir.path(), "json").unwrap();
        assert_eq!(store.get("alpha").unwrap().as_deref(), Some(&b"durable"[..]));
    }

    #[test]
    fn destroy_removes_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("idx");
        let store = open_store(&nested);
        store.put("a", b"1").unwrap();

        store.destroy().unwrap();
        assert!(!nested.exists());
        store.destroy().unwrap();
    }
}
