//! Query result cache — LRU with per-entry TTL
//!
//! Keyed by the query fingerprint only; the cache never stores raw
//! query text. A hit returns exactly the previously computed ranked
//! list until the entry expires.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::query::QueryFingerprint;
use crate::index::RankedResult;

/// Cache capacity (entries)
pub const CACHE_CAPACITY: usize = 4096;
/// Entry time-to-live
pub const CACHE_TTL: Duration = Duration::from_secs(60);

struct CachedEntry {
    results: Vec<RankedResult>,
    inserted_at: Instant,
}

/// The orchestrator's result cache
pub struct QueryCache {
    entries: Mutex<LruCache<QueryFingerprint, CachedEntry>>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_capacity(CACHE_CAPACITY, CACHE_TTL)
    }

    pub fn with_capacity(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity"),
            )),
            ttl,
        }
    }

    /// Look up a fingerprint; expired entries are evicted on contact
    pub fn get(&self, fingerprint: &QueryFingerprint) -> Option<Vec<RankedResult>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(fingerprint) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.results.clone()),
            Some(_) => {
                entries.pop(fingerprint);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, fingerprint: QueryFingerprint, results: Vec<RankedResult>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.put(
            fingerprint,
            CachedEntry {
                results,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop cached results that reference a blocked content source
    /// (takedown application)
    pub fn purge_doc(&self, doc_id: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<QueryFingerprint> = entries
            .iter()
            .filter(|(_, e)| e.results.iter().any(|r| r.doc_id == doc_id))
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::query::parse;

    fn result(doc_id: u64) -> RankedResult {
        RankedResult {
            doc_id,
            url: format!("https://example.org/{doc_id}"),
            title: String::new(),
            snippet: String::new(),
            bm25_score: 1.0,
            freshness_score: 1.0,
            trust_score: 1.0,
            authority_score: 0.0,
            combined_score: 0.9,
            crawl_time_ms: 0,
            peer: None,
        }
    }

    #[test]
    fn test_hit_returns_same_list() {
        let cache = QueryCache::new();
        let fp = parse("python asyncio").fingerprint;
        cache.put(fp, vec![result(1), result(2)]);

        let hit = cache.get(&fp).unwrap();
        assert_eq!(hit.len(), 2);
        assert_eq!(hit[0].doc_id, 1);
    }

    #[test]
    fn test_miss_on_unknown() {
        let cache = QueryCache::new();
        assert!(cache.get(&parse("unseen").fingerprint).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = QueryCache::with_capacity(16, Duration::from_millis(0));
        let fp = parse("ephemeral").fingerprint;
        cache.put(fp, vec![result(1)]);
        // Zero TTL: expired immediately and evicted on contact
        assert!(cache.get(&fp).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_bounded() {
        let cache = QueryCache::with_capacity(2, Duration::from_secs(60));
        for i in 0..5u64 {
            cache.put(parse(&format!("query {i}")).fingerprint, vec![result(i)]);
        }
        assert!(cache.len() <= 2);
    }

    #[test]
    fn test_purge_doc() {
        let cache = QueryCache::new();
        let fp1 = parse("keeps").fingerprint;
        let fp2 = parse("purged").fingerprint;
        cache.put(fp1, vec![result(1)]);
        cache.put(fp2, vec![result(2), result(99)]);

        cache.purge_doc(99);
        assert!(cache.get(&fp1).is_some());
        assert!(cache.get(&fp2).is_none());
    }
}
