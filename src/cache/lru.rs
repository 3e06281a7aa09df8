//! Generic LRU cache with per-entry TTL.
//!
//! Backed by [`lru::LruCache`] for O(1) move-to-most-recent, guarded by a
//! `parking_lot` mutex. Expiry is lazy: an expired entry is removed by the
//! read that finds it and the read counts as a miss. [`TtlLruCache::purge_expired`]
//! is an optional sweep for long-idle keys.
//!
//! Time comes from [`tokio::time::Instant`], so tests can pause and advance
//! the clock instead of sleeping.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::CacheStats;

/// A cached value plus its bookkeeping.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_accessed_at: Instant,
    access_count: u64,
}

impl<V> CacheEntry<V> {
    fn new(value: V, now: Instant) -> Self {
        Self {
            value,
            inserted_at: now,
            last_accessed_at: now,
            access_count: 0,
        }
    }

    /// Age is measured from insertion; hits never extend the lifetime.
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= ttl
    }

    fn touch(&mut self, now: Instant) {
        self.last_accessed_at = now;
        self.access_count += 1;
    }
}

/// Bookkeeping for an entry, as seen by [`TtlLruCache::entry_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    /// Time since insertion.
    pub age: Duration,
    /// Time since the last hit (or insertion).
    pub idle: Duration,
    /// Number of hits.
    pub access_count: u64,
}

/// Thread-safe LRU + TTL cache.
pub struct TtlLruCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, CacheEntry<V>>>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries for `ttl` each.
    ///
    /// A zero capacity is bumped to one; config validation rejects it earlier.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            capacity: capacity.get(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a value. Returns `None` if absent or expired.
    ///
    /// A hit moves the key to most-recent and bumps its access count.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut cache = self.inner.lock();

        let expired = match cache.get_mut(key) {
            Some(entry) if !entry.is_expired(self.ttl, now) => {
                entry.touch(now);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            },
            Some(_) => true,
            None => false,
        };

        if expired {
            cache.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or overwrite a value.
    ///
    /// When the cache is full and `key` is new, the least-recently-used entry
    /// is evicted first. Overwrites reset the entry's TTL.
    pub fn set(&self, key: K, value: V) {
        let now = Instant::now();
        let mut cache = self.inner.lock();

        if !cache.contains(&key) && cache.len() >= self.capacity {
            if cache.pop_lru().is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        cache.put(key, CacheEntry::new(value, now));
    }

    /// Check presence without touching recency. Expired entries report `false`.
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .peek(key)
            .is_some_and(|e| !e.is_expired(self.ttl, now))
    }

    /// Entry bookkeeping without touching recency.
    pub fn entry_info(&self, key: &K) -> Option<EntryInfo> {
        let now = Instant::now();
        self.inner.lock().peek(key).map(|e| EntryInfo {
            age: now.duration_since(e.inserted_at),
            idle: now.duration_since(e.last_accessed_at),
            access_count: e.access_count,
        })
    }

    /// Remove a key, returning its value if it was live.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.inner
            .lock()
            .pop(key)
            .filter(|e| !e.is_expired(self.ttl, now))
            .map(|e| e.value)
    }

    /// Drop every entry whose TTL has elapsed. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.inner.lock();

        let expired: Vec<K> = cache
            .iter()
            .filter(|(_, e)| e.is_expired(self.ttl, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }

        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Drop all entries. Counters are kept.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Current entry count (may include not-yet-purged expired entries).
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Snapshot counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cache(capacity: usize) -> TtlLruCache<&'static str, u32> {
        TtlLruCache::new(capacity, Duration::from_secs(60))
    }

    #[test]
    fn test_round_trip() {
        let cache = cache(4);
        cache.set("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"missing"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_overwrite_keeps_size() {
        let cache = cache(2);
        cache.set("a", 1);
        cache.set("a", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_lru_evicts_untouched_entry() {
        let cache = cache(3);
        cache.set("A", 1);
        cache.set("B", 2);
        cache.set("C", 3);

        cache.get(&"A");
        cache.get(&"B");
        cache.set("D", 4);

        assert!(!cache.contains(&"C"));
        assert!(cache.contains(&"A"));
        assert!(cache.contains(&"B"));
        assert!(cache.contains(&"D"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_at_capacity_does_not_evict() {
        let cache = cache(2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 3);
        assert!(cache.contains(&"b"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_hit_then_miss() {
        let cache: TtlLruCache<&str, u32> = TtlLruCache::new(8, Duration::from_millis(50));
        cache.set("k", 7);

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(cache.get(&"k"), Some(7));

        tokio::time::advance(Duration::from_millis(90)).await;
        assert_eq!(cache.get(&"k"), None);

        // Expired read removed the entry
        assert_eq!(cache.len(), 0);
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hits_do_not_extend_ttl() {
        let cache: TtlLruCache<&str, u32> = TtlLruCache::new(8, Duration::from_millis(50));
        cache.set("k", 1);
        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(10)).await;
            assert!(cache.get(&"k").is_some());
        }
        assert_eq!(cache.entry_info(&"k").map(|i| i.access_count), Some(4));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(cache.get(&"k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::new(8, Duration::from_millis(50));
        cache.set(1, 1);
        cache.set(2, 2);
        tokio::time::advance(Duration::from_millis(60)).await;
        cache.set(3, 3);

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&3), Some(3));
    }

    #[test]
    fn test_concurrent_writers() {
        let cache = std::sync::Arc::new(TtlLruCache::<u32, u32>::new(64, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        cache.set(i % 100, t);
                        cache.get(&(i % 100));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 64);
    }

    proptest! {
        #[test]
        fn prop_size_never_exceeds_capacity(capacity in 1usize..32, keys in prop::collection::vec(0u32..200, 0..300)) {
            let cache: TtlLruCache<u32, u32> = TtlLruCache::new(capacity, Duration::from_secs(60));
            for k in &keys {
                cache.set(*k, *k);
                prop_assert!(cache.len() <= capacity);
            }
            let distinct: std::collections::HashSet<_> = keys.iter().collect();
            prop_assert_eq!(cache.len(), distinct.len().min(capacity));
        }

        #[test]
        fn prop_set_then_get_returns_value(k in any::<u64>(), v in any::<u64>()) {
            let cache: TtlLruCache<u64, u64> = TtlLruCache::new(4, Duration::from_secs(60));
            cache.set(k, v);
            prop_assert_eq!(cache.get(&k), Some(v));
        }
    }
}
