//! Liveness/readiness endpoints: a `liveness`/`readiness`/`health` trio
//! built around a `CheckStatus` enum, checking the storage backend and
//! the instance actor's responsiveness.

use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::instance::InstanceHandle;
use crate::storage::EventStore;

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    storage: CheckStatus,
    instance: CheckStatus,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    storage: bool,
    instance: bool,
}

/// Liveness probe — the process is up and scheduling tasks.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe — the instance actor is alive and storage answers queries.
pub async fn readiness(
    State(instance): State<InstanceHandle>,
    State(event_store): State<Arc<dyn EventStore>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let storage_ready = check_storage(event_store.as_ref()).await;
    let instance_ready = instance.get_status() == ractor::ActorStatus::Running;
    let ready = storage_ready && instance_ready;

    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(ReadinessResponse { ready, checks: ReadinessChecks { storage: storage_ready, instance: instance_ready } }),
    )
}

/// Detailed health information for operator dashboards.
pub async fn health(
    State(instance): State<InstanceHandle>,
    State(event_store): State<Arc<dyn EventStore>>,
) -> (StatusCode, Json<HealthResponse>) {
    let storage_status = if check_storage(event_store.as_ref()).await {
        CheckStatus::Healthy
    } else {
        CheckStatus::Unhealthy
    };
    let instance_status = if instance.get_status() == ractor::ActorStatus::Running {
        CheckStatus::Healthy
    } else {
        CheckStatus::Unhealthy
    };

    let overall_healthy = matches!(storage_status, CheckStatus::Healthy) && matches!(instance_status, CheckStatus::Healthy);
    let status = if overall_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    (
        status,
        Json(HealthResponse {
            status: if overall_healthy { "healthy".to_string() } else { "unhealthy".to_string() },
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks { storage: storage_status, instance: instance_status },
        }),
    )
}

async fn check_storage(store: &dyn EventStore) -> bool {
    store.query(&[], None, 0).await.is_ok()
}
