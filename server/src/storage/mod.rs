//! Storage backend boundary. The storage backend itself (a blob+index store
//! that answers filter queries and returns a continuation token) is an
//! external collaborator — this module defines only the narrow interface
//! the core consumes, plus two concrete implementations: a Postgres-backed
//! one (`postgres.rs`, used in production) and an in-memory one
//! (`memory.rs`, used by tests and local development).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::event::{Event, Filter};

/// Opaque cursor identifying the snapshot a query ran against. Monotonicity
/// across regions is a storage-backend property, not something the core may
/// assume or compare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark(pub String);

pub struct QueryResult {
    pub events: Vec<Event>,
    pub bookmark: Bookmark,
}

/// The blob+index store: answers filter queries and persists admitted events.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn query(
        &self,
        filters: &[Filter],
        bookmark: Option<&Bookmark>,
        limit: usize,
    ) -> Result<QueryResult, StorageError>;

    /// Persists an admitted event, returning the backend's updated bookmark.
    async fn write(&self, event: &Event) -> Result<Bookmark, StorageError>;
}

/// A persisted (sub-id, filter-list) pair, as stored under `subs:<session-id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSubscription {
    pub sub_id: String,
    pub filters: Vec<Filter>,
}

/// Instance-local durable storage for subscriptions and the alarm record.
/// This is deliberately separate from `EventStore`: it survives
/// hibernation of *this* instance only, never crosses instance boundaries.
#[async_trait]
pub trait InstanceStateStore: Send + Sync {
    async fn save_subscriptions(
        &self,
        session_id: &str,
        subs: &[PersistedSubscription],
    ) -> Result<(), StorageError>;

    async fn load_subscriptions(&self, session_id: &str) -> Result<Vec<PersistedSubscription>, StorageError>;

    async fn delete_subscriptions(&self, session_id: &str) -> Result<(), StorageError>;

    /// All session ids with a persisted subscription record; used by the
    /// Lifecycle Timer to prune orphans that no longer correspond to any
    /// attached socket.
    async fn all_session_ids(&self) -> Result<Vec<String>, StorageError>;
}
