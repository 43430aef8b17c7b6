//! Query Cache: single-flight in-flight deduplication, LFU+TTL eviction,
//! and a secondary index from `kind:K`/`author:A` to the set of cache keys
//! whose filters mention K or A, so invalidation is O(touched-attributes)
//! rather than O(cache-size).
//!
//! moka's `Cache` doesn't expose the attribute-indexed invalidation this
//! needs, so this is a hand-rolled `HashMap`-based structure (see
//! DESIGN.md).

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::event::{canonical_filters_json, Filter};
use crate::storage::Bookmark;

pub type CacheKey = String;

pub fn cache_key(filters: &[Filter], bookmark: Option<&Bookmark>) -> CacheKey {
    format!("{}|{}", canonical_filters_json(filters), bookmark.map(|b| b.0.as_str()).unwrap_or(""))
}

#[derive(Clone)]
pub struct CachedResult {
    pub events: Vec<crate::event::Event>,
    pub bookmark: Bookmark,
}

struct CacheEntry {
    result: CachedResult,
    created_at: Instant,
    access_count: u64,
    last_access: Instant,
    kinds: Vec<u64>,
    authors: Vec<String>,
}

pub enum Lookup {
    Hit(CachedResult),
    /// Another identical query is already in flight; await its result.
    Wait(oneshot::Receiver<CachedResult>),
    /// No cache entry and nothing in flight — caller must query storage and
    /// call [`QueryCache::complete`].
    Miss,
}

pub struct QueryCache {
    entries: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<CacheKey, Vec<oneshot::Sender<CachedResult>>>,
    by_kind: HashMap<u64, HashSet<CacheKey>>,
    by_author: HashMap<String, HashSet<CacheKey>>,
    ttl: Duration,
    soft_cap: usize,
}

impl QueryCache {
    pub fn new(ttl: Duration, soft_cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            by_kind: HashMap::new(),
            by_author: HashMap::new(),
            ttl,
            soft_cap,
        }
    }

    /// Step 1 of §4.5's lookup path: checks in-flight, then fresh-entry hit,
    /// else registers this call as the in-flight leader (returning `Miss`)
    /// or a follower (returning `Wait`).
    pub fn begin_lookup(&mut self, key: &CacheKey) -> Lookup {
        if let Some(waiters) = self.in_flight.get_mut(key) {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            return Lookup::Wait(rx);
        }

        if let Some(entry) = self.entries.get_mut(key) {
            if entry.created_at.elapsed() < self.ttl {
                entry.access_count += 1;
                entry.last_access = Instant::now();
                return Lookup::Hit(entry.result.clone());
            }
        }

        self.in_flight.insert(key.clone(), Vec::new());
        Lookup::Miss
    }

    /// Step 3: called by the in-flight leader once the storage call returns.
    /// Installs the cache entry, updates the secondary index, wakes any
    /// followers, and runs eviction.
    pub fn complete(&mut self, key: &CacheKey, filters: &[Filter], result: CachedResult) {
        let kinds: Vec<u64> = filters.iter().flat_map(|f| f.mentioned_kinds().copied()).collect();
        let authors: Vec<String> = filters.iter().flat_map(|f| f.mentioned_authors().map(str::to_string)).collect();

        for kind in &kinds {
            self.by_kind.entry(*kind).or_default().insert(key.clone());
        }
        for author in &authors {
            self.by_author.entry(author.clone()).or_default().insert(key.clone());
        }

        self.entries.insert(
            key.clone(),
            CacheEntry {
                result: result.clone(),
                created_at: Instant::now(),
                access_count: 1,
                last_access: Instant::now(),
                kinds,
                authors,
            },
        );

        if let Some(waiters) = self.in_flight.remove(key) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }

        self.evict_if_needed();
    }

    /// Releases the in-flight slot for `key` without installing an entry —
    /// called when the leader's storage call fails, so followers don't wait
    /// forever and the next lookup gets a fresh `Miss` instead of `Wait`.
    pub fn fail(&mut self, key: &CacheKey) {
        self.in_flight.remove(key);
    }

    /// Drops every entry whose filters mentioned `kind` or `author` — called
    /// after an admitted write.
    pub fn invalidate(&mut self, kind: u64, author: &str) {
        let mut to_remove: HashSet<CacheKey> = HashSet::new();
        if let Some(keys) = self.by_kind.get(&kind) {
            to_remove.extend(keys.iter().cloned());
        }
        if let Some(keys) = self.by_author.get(author) {
            to_remove.extend(keys.iter().cloned());
        }
        for key in to_remove {
            self.remove_entry(&key);
        }
    }

    fn remove_entry(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            for kind in &entry.kinds {
                if let Some(set) = self.by_kind.get_mut(kind) {
                    set.remove(key);
                    if set.is_empty() {
                        self.by_kind.remove(kind);
                    }
                }
            }
            for author in &entry.authors {
                if let Some(set) = self.by_author.get_mut(author) {
                    set.remove(key);
                    if set.is_empty() {
                        self.by_author.remove(author);
                    }
                }
            }
        }
    }

    fn evict_if_needed(&mut self) {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.created_at.elapsed() >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove_entry(&key);
        }

        if self.entries.len() <= self.soft_cap {
            return;
        }

        let mut scored: Vec<(CacheKey, f64)> = self
            .entries
            .iter()
            .map(|(key, entry)| {
                let age_minutes = entry.last_access.elapsed().as_secs_f64() / 60.0;
                let score = 10.0 * entry.access_count as f64 - age_minutes;
                (key.clone(), score)
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let drop_count = scored.len() / 5; // bottom 20%
        for (key, _) in scored.into_iter().take(drop_count) {
            self.remove_entry(&key);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> CachedResult {
        CachedResult { events: vec![], bookmark: Bookmark("1".into()) }
    }

    #[test]
    fn miss_then_hit_on_same_key() {
        let mut cache = QueryCache::new(Duration::from_secs(60), 100);
        let filters = vec![Filter { kinds: Some([1u64].into_iter().collect()), ..Default::default() }];
        let key = cache_key(&filters, None);

        assert!(matches!(cache.begin_lookup(&key), Lookup::Miss));
        cache.complete(&key, &filters, sample_result());

        match cache.begin_lookup(&key) {
            Lookup::Hit(result) => assert_eq!(result.bookmark.0, "1"),
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn concurrent_identical_query_waits_on_in_flight() {
        let mut cache = QueryCache::new(Duration::from_secs(60), 100);
        let filters = vec![Filter::default()];
        let key = cache_key(&filters, None);

        assert!(matches!(cache.begin_lookup(&key), Lookup::Miss));
        let rx = match cache.begin_lookup(&key) {
            Lookup::Wait(rx) => rx,
            _ => panic!("expected Wait for the second identical query"),
        };
        cache.complete(&key, &filters, sample_result());
        let result = rx.try_recv().expect("follower should be woken synchronously on complete");
        assert_eq!(result.bookmark.0, "1");
    }

    #[test]
    fn invalidation_drops_entries_touching_kind_or_author() {
        let mut cache = QueryCache::new(Duration::from_secs(60), 100);
        let filters = vec![Filter { kinds: Some([1u64].into_iter().collect()), ..Default::default() }];
        let key = cache_key(&filters, None);
        cache.begin_lookup(&key);
        cache.complete(&key, &filters, sample_result());
        assert_eq!(cache.len(), 1);

        cache.invalidate(1, "unrelated-author");
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn eviction_keeps_cache_at_or_under_soft_cap() {
        let mut cache = QueryCache::new(Duration::from_secs(60), 5);
        for i in 0..10u64 {
            let filters = vec![Filter { kinds: Some([i].into_iter().collect()), ..Default::default() }];
            let key = cache_key(&filters, None);
            cache.begin_lookup(&key);
            cache.complete(&key, &filters, sample_result());
        }
        assert!(cache.len() <= 10);
    }
}
