//! Bounded LRU cache with two independent namespaces.
//!
//! * query fingerprint → ranked result list (filled after a full retrieval run)
//! * (entry id, granularity) → vectors plus the fingerprint of the text that
//!   produced them, so re-ingesting unchanged text skips the encoder
//!
//! Capacity is counted in entries. Every vector store write for an entry
//! drops that entry's vector slots and all cached query results, since any
//! ranking may have included the rewritten entry.

use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::config::CacheConfig;
use crate::memory::types::{DateRange, EntryId, Granularity, RankedEntry};

/// SHA-256 digest identifying a query or a piece of source text.
pub type Fingerprint = [u8; 32];

/// Vectors computed for one (entry, granularity) slot.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedVectors {
    pub text_fingerprint: Fingerprint,
    pub vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub query_entries: usize,
    pub vector_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct SimilarityCache {
    queries: Mutex<LruCache<Fingerprint, Vec<RankedEntry>>>,
    vectors: Mutex<LruCache<(EntryId, Granularity), CachedVectors>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

// A panic while holding a cache lock leaves the LRU structurally valid.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimilarityCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            queries: Mutex::new(LruCache::new(capacity(config.query_capacity))),
            vectors: Mutex::new(LruCache::new(capacity(config.vector_capacity))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn record(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    // ── Query namespace ──

    pub fn get_results(&self, key: &Fingerprint) -> Option<Vec<RankedEntry>> {
        let found = lock(&self.queries).get(key).cloned();
        self.record(found.is_some());
        found
    }

    pub fn put_results(&self, key: Fingerprint, results: Vec<RankedEntry>) {
        lock(&self.queries).put(key, results);
    }

    // ── Vector namespace ──

    /// Cached vectors for the slot, only when they were computed from the
    /// same text.
    pub fn get_vectors(
        &self,
        entry_id: EntryId,
        granularity: Granularity,
        text_fingerprint: &Fingerprint,
    ) -> Option<Vec<Vec<f32>>> {
        let found = lock(&self.vectors)
            .get(&(entry_id, granularity))
            .filter(|c| &c.text_fingerprint == text_fingerprint)
            .map(|c| c.vectors.clone());
        self.record(found.is_some());
        found
    }

    pub fn put_vectors(&self, entry_id: EntryId, granularity: Granularity, cached: CachedVectors) {
        lock(&self.vectors).put((entry_id, granularity), cached);
    }

    // ── Invalidation ──

    /// Drop everything derived from `entry_id` at `granularity`.
    pub fn invalidate(&self, entry_id: EntryId, granularity: Granularity) {
        lock(&self.vectors).pop(&(entry_id, granularity));
        lock(&self.queries).clear();
    }

    /// Drop every granularity of `entry_id`.
    pub fn invalidate_entry(&self, entry_id: EntryId) {
        {
            let mut vectors = lock(&self.vectors);
            for g in Granularity::ALL {
                vectors.pop(&(entry_id, g));
            }
        }
        lock(&self.queries).clear();
    }

    pub fn clear(&self) {
        lock(&self.vectors).clear();
        lock(&self.queries).clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            query_entries: lock(&self.queries).len(),
            vector_entries: lock(&self.vectors).len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Lowercase, trim and collapse internal whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Digest of a sequence of text parts. Parts are separated so that
/// `["ab", "c"]` and `["a", "bc"]` differ.
pub fn fingerprint<S: AsRef<str>>(parts: &[S]) -> Fingerprint {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0x1f]);
    }
    hasher.finalize().into()
}

/// Cache key for a retrieval: normalized text, date range and result limit.
pub fn query_fingerprint(query: &str, range: Option<&DateRange>, limit: usize) -> Fingerprint {
    let range_key = match range {
        Some(r) => format!("{}..{}", r.start.timestamp(), r.end.timestamp()),
        None => String::new(),
    };
    fingerprint(&[normalize_query(query), range_key, limit.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn small_cache(query_capacity: usize, vector_capacity: usize) -> SimilarityCache {
        SimilarityCache::new(&CacheConfig {
            query_capacity,
            vector_capacity,
        })
    }

    fn hit(id: EntryId) -> RankedEntry {
        RankedEntry {
            entry_id: id,
            score: 0.5,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn normalized_queries_share_a_fingerprint() {
        assert_eq!(
            query_fingerprint("  What about   my DOG ", None, 10),
            query_fingerprint("what about my dog", None, 10)
        );
        assert_ne!(
            query_fingerprint("dog", None, 10),
            query_fingerprint("dog", None, 5)
        );
    }

    #[test]
    fn fingerprint_separates_parts() {
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
    }

    #[test]
    fn query_results_evict_least_recently_used() {
        let cache = small_cache(2, 2);
        let (a, b, c) = (fingerprint(&["a"]), fingerprint(&["b"]), fingerprint(&["c"]));
        cache.put_results(a, vec![hit(1)]);
        cache.put_results(b, vec![hit(2)]);
        // touch a so b becomes the eviction candidate
        assert!(cache.get_results(&a).is_some());
        cache.put_results(c, vec![hit(3)]);

        assert!(cache.get_results(&b).is_none());
        assert!(cache.get_results(&a).is_some());
        assert!(cache.get_results(&c).is_some());
    }

    #[test]
    fn vectors_require_matching_text_fingerprint() {
        let cache = small_cache(4, 4);
        let fp = fingerprint(&["walked the dog"]);
        cache.put_vectors(
            7,
            Granularity::FullText,
            CachedVectors {
                text_fingerprint: fp,
                vectors: vec![vec![1.0, 0.0]],
            },
        );

        assert_eq!(
            cache.get_vectors(7, Granularity::FullText, &fp),
            Some(vec![vec![1.0, 0.0]])
        );
        assert!(cache
            .get_vectors(7, Granularity::FullText, &fingerprint(&["edited"]))
            .is_none());
        assert!(cache.get_vectors(7, Granularity::Summary, &fp).is_none());
    }

    #[test]
    fn invalidation_drops_vectors_and_query_results() {
        let cache = small_cache(4, 4);
        let fp = fingerprint(&["text"]);
        cache.put_vectors(
            1,
            Granularity::Sentence,
            CachedVectors {
                text_fingerprint: fp,
                vectors: vec![vec![0.5]],
            },
        );
        cache.put_vectors(
            2,
            Granularity::Sentence,
            CachedVectors {
                text_fingerprint: fp,
                vectors: vec![vec![0.5]],
            },
        );
        cache.put_results(fingerprint(&["q"]), vec![hit(1)]);

        cache.invalidate_entry(1);

        assert!(cache.get_vectors(1, Granularity::Sentence, &fp).is_none());
        assert!(cache.get_vectors(2, Granularity::Sentence, &fp).is_some());
        assert!(cache.get_results(&fingerprint(&["q"])).is_none());
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = small_cache(4, 4);
        let key = fingerprint(&["q"]);
        assert!(cache.get_results(&key).is_none());
        cache.put_results(key, vec![]);
        assert!(cache.get_results(&key).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.query_entries, 1);
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let cache = small_cache(0, 0);
        cache.put_results(fingerprint(&["a"]), vec![]);
        assert_eq!(cache.stats().query_entries, 1);
    }
}
