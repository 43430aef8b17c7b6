use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::FromRef;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaycore_server::config::RelayConfig;
use relaycore_server::instance::payment::{AlwaysUnpaidOracle, PaymentOracle};
use relaycore_server::instance::{self, InstanceHandle, RelayInstanceArgs};
use relaycore_server::signing::{Ed25519Verifier, SignatureVerifier};
use relaycore_server::storage::memory::{MemoryEventStore, MemoryInstanceStateStore};
use relaycore_server::storage::postgres::{init_pool, PgConfig, PostgresEventStore, PostgresInstanceStateStore};
use relaycore_server::storage::{EventStore, InstanceStateStore};
use relaycore_server::{broadcast, broadcast_endpoint, health, middleware as relay_middleware, metrics, websocket};

/// Composite Axum state; per-handler `State<T>` extractors pull the field
/// they need via `FromRef`.
#[derive(Clone, FromRef)]
struct AppState {
    instance: InstanceHandle,
    config: Arc<RelayConfig>,
    event_store: Arc<dyn EventStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }
        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Arc::new(RelayConfig::from_env());
    tracing::info!(region = %config.region, do_name = %config.do_name, auth_required = config.auth_required, "starting relay instance");

    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();

    let (event_store, state_store): (Arc<dyn EventStore>, Arc<dyn InstanceStateStore>) =
        match std::env::var("DATABASE_URL") {
            Ok(database_url) => {
                let pool = init_pool(PgConfig { database_url, ..PgConfig::default() }).await?;
                tracing::info!("connected to Postgres event store");
                (Arc::new(PostgresEventStore::new(pool.clone())), Arc::new(PostgresInstanceStateStore::new(pool)))
            }
            Err(_) => {
                tracing::warn!("DATABASE_URL not set; using in-memory storage (development only)");
                (Arc::new(MemoryEventStore::new()), Arc::new(MemoryInstanceStateStore::new()))
            }
        };

    let verifier: Arc<dyn SignatureVerifier> = Arc::new(Ed25519Verifier);
    let payment_oracle: Arc<dyn PaymentOracle> = Arc::new(AlwaysUnpaidOracle);

    let broadcast_fabric = Arc::new(broadcast::BroadcastFabric::new(
        config.do_name.clone(),
        config.regional_endpoints.clone(),
        config.internal_broadcast_token.clone(),
        config.broadcast_timeout,
    ));

    let instance_args = RelayInstanceArgs {
        config: config.clone(),
        event_store: event_store.clone(),
        state_store,
        payment_oracle,
        verifier,
        broadcast: broadcast_fabric,
    };
    let instance = instance::spawn(config.do_name.clone(), instance_args).await?;
    tracing::info!("relay instance actor started");

    let app_state = AppState { instance, config: config.clone(), event_store };

    let metrics_router: Router = if matches!(
        std::env::var("ENABLE_METRICS").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    ) {
        Router::new().route("/metrics", get(metrics::metrics_handler)).with_state(metrics_handle)
    } else {
        Router::new()
    };

    let app = Router::new()
        .route("/ws", get(websocket::upgrade))
        .route("/do-broadcast", post(broadcast_endpoint::broadcast))
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(relay_middleware::logging::log_requests))
        .with_state(app_state);

    let port: u16 = std::env::var("SERVER_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "relay instance listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
