//! Document persistence for one collection.

use super::cache::{Cache, CachePolicy};
use super::sweeper::CacheSweeper;
use crate::config::Config;
use crate::document::{decode_id, encode_id, Document};
use crate::error::{CoreError, CoreResult};
use crate::stats::DatabaseStats;
use docdb_storage::{BlobStore, FileBlobStore, KeyIter};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

type DocumentCache = Arc<Mutex<Cache<String, Document>>>;

/// Cache settings for a [`StorageManager`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheOptions {
    /// Maximum cached documents.
    pub capacity: usize,
    /// Eviction policy.
    pub policy: CachePolicy,
    /// Maximum entry age.
    pub ttl: Option<Duration>,
    /// How often the sweeper purges expired entries. Only used with a TTL.
    pub sweep_interval: Duration,
}

impl CacheOptions {
    /// Takes the cache settings from a database config.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            capacity: config.cache_capacity,
            policy: config.cache_policy,
            ttl: config.cache_ttl,
            sweep_interval: config.cache_sweep_interval,
        }
    }

    /// No caching at all.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            capacity: 0,
            policy: CachePolicy::Lru,
            ttl: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Reads and writes the documents of one collection.
///
/// Each document is one blob keyed by its encoded id; writes replace the
/// blob atomically. A write-through cache fronts reads. Blobs whose key
/// starts with `_` hold collection bookkeeping and are never returned as
/// documents.
pub struct StorageManager {
    collection: String,
    store: Arc<dyn BlobStore>,
    cache: DocumentCache,
    stats: Arc<DatabaseStats>,
    _sweeper: Option<CacheSweeper>,
}

impl StorageManager {
    /// Opens the file-backed storage of `collection` in `dir`.
    pub fn open(
        collection: impl Into<String>,
        dir: &Path,
        config: &Config,
        stats: Arc<DatabaseStats>,
    ) -> CoreResult<Self> {
        let store = FileBlobStore::open(dir, "json")?.sync_writes(config.sync_on_write);
        Self::new(collection, Arc::new(store), CacheOptions::from_config(config), stats)
    }

    /// Creates a manager over an arbitrary blob store.
    pub fn new(
        collection: impl Into<String>,
        store: Arc<dyn BlobStore>,
        cache: CacheOptions,
        stats: Arc<DatabaseStats>,
    ) -> CoreResult<Self> {
        let collection = collection.into();
        let shared = Arc::new(Mutex::new(
            Cache::new(cache.capacity, cache.policy).with_ttl(cache.ttl),
        ));
        let sweeper = match cache.ttl {
            Some(_) if cache.capacity > 0 => Some(CacheSweeper::spawn(
                Arc::downgrade(&shared),
                cache.sweep_interval,
                &collection,
            )?),
            _ => None,
        };
        Ok(Self {
            collection,
            store,
            cache: shared,
            stats,
            _sweeper: sweeper,
        })
    }

    /// Name of the collection.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Persists `doc` under `id` and refreshes the cache.
    pub fn write(&self, id: &str, doc: &Document) -> CoreResult<()> {
        let bytes = doc.to_vec()?;
        self.store.put(&encode_id(id), &bytes)?;
        let evicted = self.cache.lock().insert(id.to_string(), doc.clone());
        self.stats.record_write();
        if evicted > 0 {
            self.stats.record_cache_evictions(evicted as u64);
        }
        Ok(())
    }

    /// Returns the document stored under `id`, from cache when possible.
    pub fn read(&self, id: &str) -> CoreResult<Option<Document>> {
        self.stats.record_read();
        if let Some(doc) = self.cache.lock().get(&id.to_string()) {
            self.stats.record_cache_hit();
            return Ok(Some(doc));
        }
        self.stats.record_cache_miss();

        let Some(doc) = self.read_from_disk(id)? else {
            return Ok(None);
        };
        let evicted = self.cache.lock().insert(id.to_string(), doc.clone());
        if evicted > 0 {
            self.stats.record_cache_evictions(evicted as u64);
        }
        Ok(Some(doc))
    }

    /// Reads `id` straight from disk, bypassing and not populating the cache.
    pub fn read_from_disk(&self, id: &str) -> CoreResult<Option<Document>> {
        let key = encode_id(id);
        match self.store.get(&key)? {
            Some(bytes) => decode_document(&self.collection, &key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Deletes the document stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if no such document exists.
    pub fn remove(&self, id: &str) -> CoreResult<()> {
        self.cache.lock().remove(&id.to_string());
        match self.store.delete(&encode_id(id)) {
            Ok(()) => {
                self.stats.record_delete();
                Ok(())
            }
            Err(e) if e.is_not_found() => Err(CoreError::not_found(&self.collection, id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns true if a document is stored under `id`.
    pub fn exists(&self, id: &str) -> CoreResult<bool> {
        if self.cache.lock().contains_key(&id.to_string()) {
            return Ok(true);
        }
        Ok(self.store.contains(&encode_id(id))?)
    }

    /// Lazily enumerates stored document ids.
    pub fn ids(&self) -> CoreResult<IdIter> {
        Ok(IdIter {
            keys: self.store.keys()?,
            collection: self.collection.clone(),
        })
    }

    /// Lazily enumerates every stored document.
    ///
    /// Documents are decoded one at a time as the iterator advances. Cached
    /// copies are used when present; disk reads do not populate the cache.
    pub fn read_all(&self) -> CoreResult<DocumentIter> {
        Ok(DocumentIter {
            ids: self.ids()?,
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            collection: self.collection.clone(),
        })
    }

    /// Number of stored documents, counted from disk.
    pub fn count(&self) -> CoreResult<usize> {
        let mut count = 0;
        for id in self.ids()? {
            id?;
            count += 1;
        }
        Ok(count)
    }

    /// Drops cached documents matching `predicate`. Disk is untouched.
    pub fn invalidate_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&Document) -> bool,
    {
        self.cache.lock().invalidate_where(|_, doc| predicate(doc))
    }

    /// Purges expired cache entries now.
    pub fn purge_expired(&self) -> usize {
        self.cache.lock().purge_expired()
    }

    /// Number of cached documents.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Loads a bookkeeping blob such as `_metadata`.
    pub fn load_internal<T: DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
        debug_assert!(key.starts_with('_'));
        match self.store.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CoreError::corrupted(format!("{}/{key}", self.collection), e.to_string())),
            None => Ok(None),
        }
    }

    /// Stores a bookkeeping blob.
    pub fn save_internal<T: Serialize>(&self, key: &str, value: &T) -> CoreResult<()> {
        debug_assert!(key.starts_with('_'));
        let bytes = serde_json::to_vec_pretty(value)?;
        self.store.put(key, &bytes)?;
        Ok(())
    }
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("collection", &self.collection)
            .field("cached", &self.cached_len())
            .finish_non_exhaustive()
    }
}

fn decode_document(collection: &str, key: &str, bytes: &[u8]) -> CoreResult<Document> {
    Document::from_slice(bytes)
        .map_err(|e| CoreError::corrupted(format!("{collection}/{key}"), e.to_string()))
}

/// Iterator over stored document ids. See [`StorageManager::ids`].
pub struct IdIter {
    keys: KeyIter,
    collection: String,
}

impl Iterator for IdIter {
    type Item = CoreResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = match self.keys.next()? {
                Ok(key) => key,
                Err(e) => return Some(Err(e.into())),
            };
            match decode_id(&key) {
                Some(id) => return Some(Ok(id)),
                None => {
                    warn!(collection = %self.collection, file = %key, "skipping file with undecodable name");
                }
            }
        }
    }
}

/// Iterator over stored documents. See [`StorageManager::read_all`].
pub struct DocumentIter {
    ids: IdIter,
    store: Arc<dyn BlobStore>,
    cache: DocumentCache,
    collection: String,
}

impl Iterator for DocumentIter {
    type Item = CoreResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = match self.ids.next()? {
                Ok(id) => id,
                Err(e) => return Some(Err(e)),
            };
            if let Some(doc) = self.cache.lock().peek(&id) {
                return Some(Ok(doc.clone()));
            }
            let key = encode_id(&id);
            match self.store.get(&key) {
                Ok(Some(bytes)) => return Some(decode_document(&self.collection, &key, &bytes)),
                // Removed since the listing was taken.
                Ok(None) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
