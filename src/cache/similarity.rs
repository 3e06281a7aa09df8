//! Cache of similarity-search responses.

use std::sync::Arc;

use super::fingerprint::{similarity_fingerprint, Fingerprint};
use super::lru::TtlLruCache;
use super::CacheStats;
use crate::config::CacheConfig;
use crate::detector::{Metadata, SearchHit};

/// Ranked hits shared between the cache and its readers.
pub type SearchHits = Arc<Vec<SearchHit>>;

/// Similarity response cache keyed by sampled query vector.
pub struct SimilarityCache {
    entries: TtlLruCache<Fingerprint, SearchHits>,
}

impl SimilarityCache {
    /// Create from config
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: TtlLruCache::new(config.max_size, config.ttl()),
        }
    }

    /// Fingerprint a query
    pub fn key(
        &self,
        embedding: &[f32],
        top_k: usize,
        score_threshold: f32,
        filters: &Metadata,
    ) -> Fingerprint {
        similarity_fingerprint(embedding, top_k, score_threshold, filters)
    }

    /// Cached hits, if live
    pub fn get(&self, key: &Fingerprint) -> Option<SearchHits> {
        self.entries.get(key)
    }

    /// Store hits
    pub fn set(&self, key: Fingerprint, hits: SearchHits) {
        self.entries.set(key, hits);
    }

    /// Drop expired responses
    pub fn purge_expired(&self) -> usize {
        self.entries.purge_expired()
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counters snapshot
    pub fn stats(&self) -> CacheStats {
        self.entries.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_by_query_shape() {
        let cache = SimilarityCache::new(&CacheConfig::similarity_default());
        let embedding = vec![0.25f32; 64];
        let filters = Metadata::new();

        let key = cache.key(&embedding, 3, 0.5, &filters);
        let hits = Arc::new(vec![SearchHit {
            id: "ex-1".into(),
            score: 0.93,
            metadata: Metadata::new(),
        }]);
        cache.set(key, hits.clone());

        assert_eq!(cache.get(&key).as_deref(), Some(&*hits));
        assert!(cache.get(&cache.key(&embedding, 4, 0.5, &filters)).is_none());
    }
}
