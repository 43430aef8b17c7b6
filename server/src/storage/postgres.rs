//! Postgres-backed `EventStore` and `InstanceStateStore`. Query semantics
//! beyond straightforward id/author/kind/tag/time filtering (replaceable
//! events, full-text search, etc.) belong to the storage backend, which is
//! explicitly out of this core's scope — this impl covers only the narrow
//! query/write/persist contract the core actually calls through.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::error::StorageError;
use crate::event::{Event, Filter};

use super::{Bookmark, EventStore, InstanceStateStore, PersistedSubscription, QueryResult};

#[derive(Debug, Clone)]
pub struct PgConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/relaycore".to_string()),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

pub async fn init_pool(config: PgConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    sqlx::migrate!("./migrations").run(&pool).await.context("failed to run database migrations")?;
    Ok(pool)
}

pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn query(
        &self,
        filters: &[Filter],
        bookmark: Option<&Bookmark>,
        limit: usize,
    ) -> Result<QueryResult, StorageError> {
        // Authors/kinds/ids narrow via ANY(); the remaining predicates
        // (tag constraints, since/until) are applied in-process against the
        // candidate rows using the same pure matching function the in-memory
        // backend uses, so the two implementations always agree.
        let mut authors: Vec<String> = Vec::new();
        let mut kinds: Vec<i64> = Vec::new();
        for f in filters {
            authors.extend(f.mentioned_authors().map(str::to_string));
            kinds.extend(f.mentioned_kinds().map(|k| *k as i64));
        }

        let rows = sqlx::query(
            r#"
            SELECT id, pubkey, created_at, kind, tags, content, sig
            FROM events
            WHERE ($1::text[] IS NULL OR pubkey = ANY($1))
              AND ($2::bigint[] IS NULL OR kind = ANY($2))
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(if authors.is_empty() { None } else { Some(&authors) })
        .bind(if kinds.is_empty() { None } else { Some(&kinds) })
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let tags_json: serde_json::Value = row
                .try_get("tags")
                .map_err(|e| StorageError::QueryFailed(e.to_string()))?;
            let tags = serde_json::from_value(tags_json).unwrap_or_default();
            events.push(Event {
                id: row.try_get("id").map_err(|e| StorageError::QueryFailed(e.to_string()))?,
                pubkey: row.try_get("pubkey").map_err(|e| StorageError::QueryFailed(e.to_string()))?,
                created_at: row.try_get("created_at").map_err(|e| StorageError::QueryFailed(e.to_string()))?,
                kind: row.try_get::<i64, _>("kind").map_err(|e| StorageError::QueryFailed(e.to_string()))? as u64,
                tags,
                content: row.try_get("content").map_err(|e| StorageError::QueryFailed(e.to_string()))?,
                sig: row.try_get("sig").map_err(|e| StorageError::QueryFailed(e.to_string()))?,
            });
        }
        let events: Vec<Event> = events
            .into_iter()
            .filter(|e| crate::instance::matching::filter_list_matches(filters, e))
            .collect();

        let next = bookmark.map(|b| b.0.clone()).unwrap_or_else(|| "0".to_string());
        Ok(QueryResult { events, bookmark: Bookmark(next) })
    }

    async fn write(&self, event: &Event) -> Result<Bookmark, StorageError> {
        let tags_json = serde_json::to_value(&event.tags).unwrap_or(serde_json::Value::Array(vec![]));
        let seq: i64 = sqlx::query(
            r#"
            INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            RETURNING seq
            "#,
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.created_at)
        .bind(event.kind as i64)
        .bind(tags_json)
        .bind(&event.content)
        .bind(&event.sig)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?
        .map(|row| row.get::<i64, _>("seq"))
        .unwrap_or(0);

        Ok(Bookmark(seq.to_string()))
    }
}

pub struct PostgresInstanceStateStore {
    pool: PgPool,
}

impl PostgresInstanceStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStateStore for PostgresInstanceStateStore {
    async fn save_subscriptions(
        &self,
        session_id: &str,
        subs: &[PersistedSubscription],
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_value(subs).unwrap_or(serde_json::Value::Array(vec![]));
        sqlx::query(
            r#"
            INSERT INTO instance_state (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(format!("subs:{session_id}"))
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;
        Ok(())
    }

    async fn load_subscriptions(&self, session_id: &str) -> Result<Vec<PersistedSubscription>, StorageError> {
        let row = sqlx::query("SELECT value FROM instance_state WHERE key = $1")
            .bind(format!("subs:{session_id}"))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;
        match row {
            Some(row) => {
                let value: serde_json::Value =
                    row.try_get("value").map_err(|e| StorageError::QueryFailed(e.to_string()))?;
                Ok(serde_json::from_value(value).unwrap_or_default())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn delete_subscriptions(&self, session_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM instance_state WHERE key = $1")
            .bind(format!("subs:{session_id}"))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;
        Ok(())
    }

    async fn all_session_ids(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT key FROM instance_state WHERE key LIKE 'subs:%'")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("key").ok())
            .filter_map(|key| key.strip_prefix("subs:").map(str::to_string))
            .collect())
    }
}
