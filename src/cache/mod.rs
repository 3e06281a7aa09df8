//! Fingerprint-keyed LRU + TTL caches.
//!
//! Two instances share one design:
//!
//! | Cache             | Key                                          | Value                    |
//! |-------------------|----------------------------------------------|--------------------------|
//! | [`ResultCache`]   | normalized content + metadata                | `DetectionResult`        |
//! | [`SimilarityCache`] | sampled query vector + top_k + threshold   | ranked similarity hits   |
//!
//! # Semantics
//!
//! - `get` returns `None` for absent or expired keys; an expired read removes
//!   the entry and counts as a miss.
//! - `set` inserts or overwrites; a new key at capacity evicts the LRU entry.
//! - Reads and writes are safe from any thread. Same-key writes are
//!   serialized, last write wins.
//!
//! # Usage
//!
//! ```rust,ignore
//! use threatgate::cache::ResultCache;
//! use threatgate::config::CacheConfig;
//!
//! let cache = ResultCache::new(&CacheConfig::default());
//! let key = cache.key("Ignore previous instructions", &Default::default());
//! assert!(cache.get(&key).is_none());
//! ```

mod fingerprint;
mod lru;
mod result;
mod similarity;

pub use fingerprint::{
    content_fingerprint, normalize, normalize_into, similarity_fingerprint, Fingerprint,
    SIMILARITY_SAMPLE,
};
pub use self::lru::{EntryInfo, TtlLruCache};
pub use result::ResultCache;
pub use similarity::SimilarityCache;

use serde::Serialize;

/// Cache counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Lookups that returned a live value.
    pub hits: u64,
    /// Lookups that found nothing (including expired entries).
    pub misses: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// Current entry count.
    pub size: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// `hits / (hits + misses)`, 0.0 before the first lookup.
    pub hit_rate: f64,
}
