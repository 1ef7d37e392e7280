//! # docdb storage
//!
//! Byte-level storage primitives for docdb.
//!
//! This crate is the lowest layer of the store. Everything here is an
//! **opaque byte store**: it never interprets the documents, index nodes or
//! log records it holds.
//!
//! ## Available Stores
//!
//! - [`BlobStore`] - keyed blobs, one value per key
//!   - [`FileBlobStore`] - one file per key, replaced atomically on write
//!   - [`MemoryBlobStore`] - for tests and ephemeral trees
//! - [`AppendFile`] - append-only file with a tracked size, used for log segments
//!
//! ## Example
//!
//! ```rust
//! use docdb_storage::{BlobStore, MemoryBlobStore};
//!
//! let store = MemoryBlobStore::new();
//! store.put("alpha", b"hello world").unwrap();
//! assert_eq!(store.get("alpha").unwrap().as_deref(), Some(&b"hello world"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod append;
mod blob;
mod error;
mod file;
mod memory;

pub use append::AppendFile;
pub use blob::{is_internal_key, BlobStore, KeyIter};
pub use error::{StorageError, StorageResult};
pub use file::FileBlobStore;
pub use memory::MemoryBlobStore;
