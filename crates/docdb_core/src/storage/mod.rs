//! Cached document storage.
//!
//! - [`Cache`]: generic LRU/LFU cache with TTL, shared with the index arena
//! - [`StorageManager`]: per-collection document blobs behind the cache
//! - [`CacheSweeper`]: background purge of expired entries

mod cache;
mod manager;
mod sweeper;

pub use cache::{Cache, CachePolicy};
pub use manager::{CacheOptions, DocumentIter, IdIter, StorageManager};
pub use sweeper::CacheSweeper;
