//! Append-only file with a tracked size.

use crate::error::{StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// An append-only file.
///
/// The size is tracked in memory so callers can learn the offset of every
/// append without a `stat` call. Data is only ever added at the end.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` to push data to the OS
/// - `sync()` calls `File::sync_data()` to ensure data is on disk
///
/// # Example
///
/// ```no_run
/// use docdb_storage::AppendFile;
/// use std::path::Path;
///
/// let mut file = AppendFile::open(Path::new("segment-1.log")).unwrap();
/// let offset = file.append(b"record\n").unwrap();
/// file.sync().unwrap();
/// assert_eq!(offset, 0);
/// ```
#[derive(Debug)]
pub struct AppendFile {
    path: PathBuf,
    file: File,
    size: u64,
}

impl AppendFile {
    /// Opens or creates the file at `path`, positioned at its end.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StorageError::io(path, e))?;

        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|e| StorageError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
        })
    }

    /// Appends `data` and returns the offset it was written at.
    ///
    /// A failed write is rolled back: the file is truncated to its previous
    /// size, so a later append never lands behind a torn fragment.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.append_with(data, |file, data| file.write_all(data))
    }

    fn append_with<F>(&mut self, data: &[u8], write: F) -> StorageResult<u64>
    where
        F: FnOnce(&mut File, &[u8]) -> io::Result<()>,
    {
        let offset = self.size;
        if data.is_empty() {
            return Ok(offset);
        }
        if let Err(e) = write(&mut self.file, data) {
            self.truncate_to_size()?;
            return Err(StorageError::io(&self.path, e));
        }
        self.size += data.len() as u64;
        Ok(offset)
    }

    /// Drops anything past the last complete append.
    fn truncate_to_size(&mut self) -> StorageResult<()> {
        self.file
            .set_len(self.size)
            .and_then(|()| self.file.seek(SeekFrom::Start(self.size)))
            .map(|_| ())
            .map_err(|e| StorageError::io(&self.path, e))
    }

    /// Pushes buffered data to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> StorageResult<()> {
        self.file
            .flush()
            .map_err(|e| StorageError::io(&self.path, e))
    }

    /// Forces appended data to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> StorageResult<()> {
        self.file
            .sync_data()
            .map_err(|e| StorageError::io(&self.path, e))
    }

    /// Returns the current size, which is the offset of the next append.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
