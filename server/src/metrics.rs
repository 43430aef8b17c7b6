//! Prometheus metrics recorder: `MetricsRecorder` wraps a `PrometheusHandle`,
//! `metrics_handler` exposes it as a plain `State` extractor.

use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!("relay_events_admitted_total", "Events accepted by the admission pipeline");
        metrics::describe_counter!("relay_events_rejected_total", "Events rejected by the admission pipeline, by reason");
        metrics::describe_counter!("relay_subscriptions_opened_total", "REQ frames that opened a subscription");
        metrics::describe_counter!("relay_subscriptions_closed_total", "CLOSE frames and server-initiated CLOSED frames");
        metrics::describe_counter!("relay_broadcast_cross_region_total", "Cross-region broadcast POSTs attempted");
        metrics::describe_counter!("relay_broadcast_duplicate_total", "Inbound cross-region broadcasts suppressed as duplicates");
        metrics::describe_histogram!("relay_query_cache_lookup_seconds", "Query cache lookup latency, hit or miss");
        metrics::describe_gauge!("relay_sessions_active", "Sessions currently attached to this instance");
        metrics::describe_gauge!("relay_query_cache_entries", "Entries currently held in the query cache");

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for the Prometheus scrape endpoint.
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}

pub fn record_event_admitted() {
    metrics::counter!("relay_events_admitted_total", 1);
}

pub fn record_event_rejected(_reason: &'static str) {
    metrics::counter!("relay_events_rejected_total", 1);
}

pub fn record_subscription_opened() {
    metrics::counter!("relay_subscriptions_opened_total", 1);
}

pub fn record_subscription_closed() {
    metrics::counter!("relay_subscriptions_closed_total", 1);
}

pub fn record_broadcast_cross_region() {
    metrics::counter!("relay_broadcast_cross_region_total", 1);
}

pub fn record_broadcast_duplicate() {
    metrics::counter!("relay_broadcast_duplicate_total", 1);
}
