//! Database configuration.

use crate::storage::CachePolicy;
use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database directory if it doesn't exist.
    pub create_if_missing: bool,

    /// B-tree order `m`: non-root nodes hold `m-1..=2m-1` keys.
    pub btree_order: usize,

    /// Number of decoded B-tree nodes cached per index.
    pub node_cache_capacity: usize,

    /// Number of documents cached per collection.
    pub cache_capacity: usize,

    /// Eviction policy of the document cache.
    pub cache_policy: CachePolicy,

    /// Maximum age of a cached document (`None` = no expiry).
    pub cache_ttl: Option<Duration>,

    /// How often the background sweep purges expired cache entries.
    pub cache_sweep_interval: Duration,

    /// Maximum size of a WAL segment before rotation.
    pub max_segment_size: u64,

    /// How long the WAL writer waits to gather a batch.
    pub wal_batch_window: Duration,

    /// Maximum number of records per WAL batch.
    pub wal_max_batch: usize,

    /// Whether to fsync the WAL after every batch and documents after every write.
    pub sync_on_write: bool,

    /// Deadline for gated operations (WAL acknowledgement, index admission).
    pub operation_timeout: Duration,

    /// Whether opening a collection flagged by recovery rebuilds its indexes.
    ///
    /// When off, the indexes are opened as stored and queries fall back to
    /// full scans until the next write rebuilds them.
    pub reindex_on_open: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            btree_order: 16,
            node_cache_capacity: 256,
            cache_capacity: 1024,
            cache_policy: CachePolicy::Lru,
            cache_ttl: None,
            cache_sweep_interval: Duration::from_secs(30),
            max_segment_size: 4 * 1024 * 1024, // 4 MB
            wal_batch_window: Duration::from_millis(2),
            wal_max_batch: 256,
            sync_on_write: true,
            operation_timeout: Duration::from_secs(5),
            reindex_on_open: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the B-tree order. Values below 2 are raised to 2.
    #[must_use]
    pub const fn btree_order(mut self, order: usize) -> Self {
        self.btree_order = if order < 2 { 2 } else { order };
        self
    }

    /// Sets the decoded node cache capacity.
    #[must_use]
    pub const fn node_cache_capacity(mut self, capacity: usize) -> Self {
        self.node_cache_capacity = capacity;
        self
    }

    /// Sets the document cache capacity.
    #[must_use]
    pub const fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the document cache eviction policy.
    #[must_use]
    pub const fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Sets the document cache TTL.
    #[must_use]
    pub const fn cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the interval of the background TTL sweep.
    #[must_use]
    pub const fn cache_sweep_interval(mut self, interval: Duration) -> Self {
        self.cache_sweep_interval = interval;
        self
    }

    /// Sets maximum WAL segment size.
    #[must_use]
    pub const fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Sets the WAL batching window.
    #[must_use]
    pub const fn wal_batch_window(mut self, window: Duration) -> Self {
        self.wal_batch_window = window;
        self
    }

    /// Sets the maximum number of records per WAL batch.
    #[must_use]
    pub const fn wal_max_batch(mut self, max: usize) -> Self {
        self.wal_max_batch = if max == 0 { 1 } else { max };
        self
    }

    /// Sets whether writes are fsynced.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the deadline for gated operations.
    #[must_use]
    pub const fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets whether flagged collections are reindexed when opened.
    #[must_use]
    pub const fn reindex_on_open(mut self, value: bool) -> Self {
        self.reindex_on_open = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_write);
        assert_eq!(config.btree_order, 16);
        assert_eq!(config.cache_policy, CachePolicy::Lru);
        assert!(config.cache_ttl.is_none());
        assert!(config.reindex_on_open);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .sync_on_write(false)
            .max_segment_size(1024)
            .cache_policy(CachePolicy::Lfu)
            .btree_order(3);

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_write);
        assert_eq!(config.max_segment_size, 1024);
        assert_eq!(config.cache_policy, CachePolicy::Lfu);
        assert_eq!(config.btree_order, 3);
    }

    #[test]
    fn order_and_batch_are_clamped() {
        let config = Config::new().btree_order(1).wal_max_batch(0);
        assert_eq!(config.btree_order, 2);
        assert_eq!(config.wal_max_batch, 1);
    }
}
