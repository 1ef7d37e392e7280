//! Bounded, policy-driven cache.
//!
//! Used for documents by the storage manager and for decoded nodes by the
//! B-tree arena.
//!
//! # Policies
//!
//! - [`CachePolicy::Lru`]: evict the least recently read or written entry
//! - [`CachePolicy::Lfu`]: evict the least frequently accessed entry; ties go
//!   to the oldest insertion
//!
//! When the cache is full an insert evicts a whole batch of victims rather
//! than one, so a full cache does not pay for an eviction on every insert.
//! Entries older than the TTL are treated as absent and can be purged in bulk.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Cache eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Least recently used.
    #[default]
    Lru,
    /// Least frequently used, oldest first on ties.
    Lfu,
}

/// Ordering key of an entry. Lowest is evicted first.
type Rank = (u64, u64);

#[derive(Debug)]
struct Entry<V> {
    value: V,
    /// Time of the last write; drives TTL expiry.
    timestamp: Instant,
    /// Accesses since insertion (LFU).
    frequency: u64,
    /// Insertion tick, used to break LFU ties.
    inserted: u64,
    rank: Rank,
}

/// A capacity-bounded cache with LRU or LFU eviction and optional TTL.
#[derive(Debug)]
pub struct Cache<K, V> {
    policy: CachePolicy,
    capacity: usize,
    ttl: Option<Duration>,
    eviction_batch: usize,
    entries: HashMap<K, Entry<V>>,
    order: BTreeMap<Rank, K>,
    tick: u64,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache holding at most `capacity` entries.
    ///
    /// The eviction batch defaults to a tenth of the capacity, at least one.
    #[must_use]
    pub fn new(capacity: usize, policy: CachePolicy) -> Self {
        Self {
            policy,
            capacity,
            ttl: None,
            eviction_batch: (capacity / 10).max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
        }
    }

    /// Sets the maximum entry age.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets how many entries are evicted at once when the cache is full.
    #[must_use]
    pub fn with_eviction_batch(mut self, batch: usize) -> Self {
        self.eviction_batch = batch.max(1);
        self
    }

    /// Returns the configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the eviction policy.
    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Returns the number of cached entries (expired ones included until purged).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a clone of the cached value and records the access.
    ///
    /// Expired entries are removed and reported as misses.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = self.is_expired(self.entries.get(key)?);
        if expired {
            self.remove(key);
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|e| e.value.clone())
    }

    /// Returns the cached value without recording an access.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| !self.is_expired(e))
            .map(|e| &e.value)
    }

    /// Returns true if a live entry exists for `key`.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    /// Inserts or replaces an entry. Returns the number of evicted entries.
    pub fn insert(&mut self, key: K, value: V) -> usize {
        if self.capacity == 0 {
            return 0;
        }

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.timestamp = Instant::now();
            self.touch(&key);
            return 0;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict(self.eviction_batch.min(self.entries.len()))
        } else {
            0
        };

        self.tick += 1;
        let inserted = self.tick;
        let rank = match self.policy {
            CachePolicy::Lru => (inserted, 0),
            CachePolicy::Lfu => (1, inserted),
        };
        self.order.insert(rank, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                timestamp: Instant::now(),
                frequency: 1,
                inserted,
                rank,
            },
        );
        evicted
    }

    /// Removes an entry, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.rank);
        Some(entry.value)
    }

    /// Removes every entry whose age exceeds the TTL. Returns how many.
    pub fn purge_expired(&mut self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.timestamp) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Removes every entry matching `predicate`. Returns how many.
    pub fn invalidate_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let doomed: Vec<K> = self
            .entries
            .iter()
            .filter(|(k, e)| predicate(k, &e.value))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    /// Removes everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn is_expired(&self, entry: &Entry<V>) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.timestamp.elapsed() > ttl)
    }

    fn touch(&mut self, key: &K) {
        self.tick += 1;
        let tick = self.tick;
        let policy = self.policy;
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        self.order.remove(&entry.rank);
        entry.frequency += 1;
        entry.rank = match policy {
            CachePolicy::Lru => (tick, 0),
            CachePolicy::Lfu => (entry.frequency, entry.inserted),
        };
        self.order.insert(entry.rank, key.clone());
    }

    fn evict(&mut self, count: usize) -> usize {
        let mut evicted = 0;
        while evicted < count {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            evicted += 1;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut cache = Cache::new(3, CachePolicy::Lru);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);

        // Reading "a" makes "b" the oldest.
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.insert("d", 4), 1);

        assert!(cache.contains_key(&"a"));
        assert!(!cache.contains_key(&"b"));
        assert!(cache.contains_key(&"c"));
        assert!(cache.contains_key(&"d"));
    }

    #[test]
    fn lru_writes_refresh_position() {
        let mut cache = Cache::new(2, CachePolicy::Lru);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);
        cache.insert("c", 3);

        assert_eq!(cache.peek(&"a"), Some(&10));
        assert!(!cache.contains_key(&"b"));
    }

    #[test]
    fn lfu_evicts_least_frequently_used() {
        let mut cache = Cache::new(3, CachePolicy::Lfu);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);
        cache.get(&"a");
        cache.get(&"a");
        cache.get(&"c");

        cache.insert("d", 4);
        assert!(!cache.contains_key(&"b"));
        assert!(cache.contains_key(&"a"));
        assert!(cache.contains_key(&"c"));
    }

    #[test]
    fn lfu_ties_evict_oldest_insertion() {
        let mut cache = Cache::new(3, CachePolicy::Lfu);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);

        cache.insert("d", 4);
        assert!(!cache.contains_key(&"a"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn full_cache_evicts_a_batch() {
        let mut cache = Cache::new(10, CachePolicy::Lru).with_eviction_batch(4);
        for i in 0..10 {
            cache.insert(i, i);
        }
        assert_eq!(cache.insert(10, 10), 4);
        assert_eq!(cache.len(), 7);
        for i in 0..4 {
            assert!(!cache.contains_key(&i));
        }
        // No eviction until full again.
        assert_eq!(cache.insert(11, 11), 0);
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let mut cache = Cache::new(0, CachePolicy::Lru);
        cache.insert("a", 1);
        assert!(cache.is_empty());
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn ttl_expires_entries() {
        let mut cache =
            Cache::new(4, CachePolicy::Lru).with_ttl(Some(Duration::from_millis(20)));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));

        sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn purge_expired_removes_in_bulk() {
        let mut cache =
            Cache::new(4, CachePolicy::Lfu).with_ttl(Some(Duration::from_millis(20)));
        cache.insert("a", 1);
        cache.insert("b", 2);
        sleep(Duration::from_millis(40));
        cache.insert("c", 3);

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key(&"c"));
    }

    #[test]
    fn invalidate_where_matches_values() {
        let mut cache = Cache::new(8, CachePolicy::Lru);
        for i in 0..6 {
            cache.insert(i, i * 10);
        }
        assert_eq!(cache.invalidate_where(|_, v| *v >= 30), 3);
        assert_eq!(cache.len(), 3);
    }
}
