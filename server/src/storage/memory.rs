//! In-memory storage backend — used by unit/integration tests and local
//! development, where running Postgres is unnecessary overhead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StorageError;
use crate::event::{Event, Filter};
use crate::instance::matching::filter_list_matches;

use super::{Bookmark, EventStore, InstanceStateStore, PersistedSubscription, QueryResult};

pub struct MemoryEventStore {
    events: RwLock<Vec<Event>>,
    next_bookmark: AtomicU64,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self { events: RwLock::new(Vec::new()), next_bookmark: AtomicU64::new(1) }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn query(
        &self,
        filters: &[Filter],
        _bookmark: Option<&Bookmark>,
        limit: usize,
    ) -> Result<QueryResult, StorageError> {
        let events = self.events.read();
        let matched: Vec<Event> = events
            .iter()
            .rev()
            .filter(|e| filter_list_matches(filters, e))
            .take(limit)
            .cloned()
            .collect();
        let seq = self.next_bookmark.load(Ordering::SeqCst);
        Ok(QueryResult { events: matched, bookmark: Bookmark(seq.to_string()) })
    }

    async fn write(&self, event: &Event) -> Result<Bookmark, StorageError> {
        let seq = self.next_bookmark.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.write().push(event.clone());
        Ok(Bookmark(seq.to_string()))
    }
}

pub struct MemoryInstanceStateStore {
    subs: RwLock<HashMap<String, Vec<PersistedSubscription>>>,
}

impl MemoryInstanceStateStore {
    pub fn new() -> Self {
        Self { subs: RwLock::new(HashMap::new()) }
    }
}

impl Default for MemoryInstanceStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStateStore for MemoryInstanceStateStore {
    async fn save_subscriptions(
        &self,
        session_id: &str,
        subs: &[PersistedSubscription],
    ) -> Result<(), StorageError> {
        self.subs.write().insert(session_id.to_string(), subs.to_vec());
        Ok(())
    }

    async fn load_subscriptions(&self, session_id: &str) -> Result<Vec<PersistedSubscription>, StorageError> {
        Ok(self.subs.read().get(session_id).cloned().unwrap_or_default())
    }

    async fn delete_subscriptions(&self, session_id: &str) -> Result<(), StorageError> {
        self.subs.write().remove(session_id);
        Ok(())
    }

    async fn all_session_ids(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.subs.read().keys().cloned().collect())
    }
}
