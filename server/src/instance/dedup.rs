//! Dedup Record: suppresses cross-region broadcast echo for five minutes by
//! default, via a `moka::sync::Cache` with a fixed TTL.

use std::time::Duration;

use moka::sync::Cache;

pub struct DedupMap {
    cache: Cache<String, ()>,
}

impl DedupMap {
    pub fn new(retention: Duration) -> Self {
        let cache = Cache::builder().time_to_live(retention).max_capacity(1_000_000).build();
        Self { cache }
    }

    /// Returns `true` if `event_id` was already recorded (this instance has
    /// already processed it, locally or via a sibling echo).
    pub fn contains(&self, event_id: &str) -> bool {
        self.cache.get(event_id).is_some()
    }

    pub fn record(&self, event_id: &str) {
        self.cache.insert(event_id.to_string(), ());
    }

    /// True if this call recorded the id for the first time (i.e. it was
    /// not a duplicate) — the common check-then-record call site.
    pub fn record_if_new(&self, event_id: &str) -> bool {
        if self.contains(event_id) {
            false
        } else {
            self.record(event_id);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_if_new_is_true_exactly_once() {
        let dedup = DedupMap::new(Duration::from_secs(300));
        assert!(dedup.record_if_new("evt1"));
        assert!(!dedup.record_if_new("evt1"));
        assert!(dedup.record_if_new("evt2"));
    }
}
