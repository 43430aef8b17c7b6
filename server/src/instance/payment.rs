//! Payment Cache Entry and oracle boundary. The payment-status oracle is an
//! external collaborator; this module defines the narrow interface plus a
//! TTL/capacity-bounded cache in front of it, a TTL-bounded
//! `moka::sync::Cache` keyed by pubkey.

use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;

/// A lookup returning boolean has-paid for an author key.
#[async_trait]
pub trait PaymentOracle: Send + Sync {
    async fn has_paid(&self, author_pubkey: &str) -> bool;
}

/// Oracle that treats nobody as having paid — useful when
/// `PAY_TO_RELAY_ENABLED` is false and no oracle is configured.
pub struct AlwaysUnpaidOracle;

#[async_trait]
impl PaymentOracle for AlwaysUnpaidOracle {
    async fn has_paid(&self, _author_pubkey: &str) -> bool {
        false
    }
}

pub struct PaymentCache {
    cache: Cache<String, bool>,
}

impl PaymentCache {
    pub fn new(ttl: Duration, cap: usize) -> Self {
        let cache = Cache::builder().time_to_live(ttl).max_capacity(cap as u64).build();
        Self { cache }
    }

    pub fn get(&self, author_pubkey: &str) -> Option<bool> {
        self.cache.get(author_pubkey)
    }

    pub fn insert(&self, author_pubkey: &str, has_paid: bool) {
        self.cache.insert(author_pubkey.to_string(), has_paid);
    }

    /// Consults the cache, falling back to the oracle on miss and caching
    /// the result.
    pub async fn has_paid(&self, oracle: &dyn PaymentOracle, author_pubkey: &str) -> bool {
        if let Some(cached) = self.get(author_pubkey) {
            return cached;
        }
        let paid = oracle.has_paid(author_pubkey).await;
        self.insert(author_pubkey, paid);
        paid
    }
}
