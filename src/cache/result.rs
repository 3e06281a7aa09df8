//! Cache of completed detection verdicts.

use super::fingerprint::{content_fingerprint, Fingerprint};
use super::lru::TtlLruCache;
use super::CacheStats;
use crate::aggregate::DetectionResult;
use crate::config::CacheConfig;
use crate::detector::Metadata;

/// Verdict cache keyed by content fingerprint.
pub struct ResultCache {
    entries: TtlLruCache<Fingerprint, DetectionResult>,
}

impl ResultCache {
    /// Create from config
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: TtlLruCache::new(config.max_size, config.ttl()),
        }
    }

    /// Fingerprint a request
    pub fn key(&self, content: &str, metadata: &Metadata) -> Fingerprint {
        content_fingerprint(content, metadata)
    }

    /// Cached verdict, if live
    pub fn get(&self, key: &Fingerprint) -> Option<DetectionResult> {
        let hit = self.entries.get(key);
        tracing::debug!(key = ?key, hit = hit.is_some(), "result cache lookup");
        hit
    }

    /// Store a verdict
    pub fn set(&self, key: Fingerprint, result: DetectionResult) {
        self.entries.set(key, result);
    }

    /// Drop expired verdicts
    pub fn purge_expired(&self) -> usize {
        self.entries.purge_expired()
    }

    /// Drop all verdicts
    pub fn clear(&self) {
        self.entries.clear();
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
    use crate::aggregate::DetectionResult;

    #[test]
    fn test_equivalent_content_shares_entry() {
        let cache = ResultCache::new(&CacheConfig::default());
        let meta = Metadata::new();

        let key = cache.key("Ignore  Previous Instructions", &meta);
        let result = DetectionResult::benign(key);
        cache.set(key, result.clone());

        let same = cache.key("ignore previous instructions", &meta);
        assert_eq!(cache.get(&same), Some(result));
        assert_eq!(cache.stats().hits, 1);
    }
}
