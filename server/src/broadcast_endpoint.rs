//! `POST /do-broadcast` — sibling-to-sibling cross-region fan-out delivery.
//!
//! A plain `State` + body extractor handler returning a `Json<Value>`,
//! gated by a shared-secret bearer-token check since this endpoint is only
//! ever called by sibling instances, never a client.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::warn;

use crate::config::RelayConfig;
use crate::event::Event;
use crate::instance::{InstanceHandle, InstanceMessage};

#[derive(Debug, Deserialize)]
pub struct BroadcastPayload {
    pub event: Event,
    #[serde(rename = "sourceDoId")]
    pub source_do_id: String,
}

#[derive(Debug, Serialize)]
pub struct BroadcastAck {
    pub success: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

/// Rejects any caller that doesn't present the internal shared-secret bearer
/// token.
pub async fn broadcast(
    State(instance): State<InstanceHandle>,
    State(config): State<Arc<RelayConfig>>,
    headers: HeaderMap,
    Json(payload): Json<BroadcastPayload>,
) -> Result<Json<BroadcastAck>, (StatusCode, Json<Value>)> {
    if !authorized(&headers, &config.internal_broadcast_token) {
        return Err((StatusCode::UNAUTHORIZED, Json(json!({"success": false}))));
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    if instance
        .send_message(InstanceMessage::InboundBroadcast { event: payload.event, reply: reply_tx })
        .is_err()
    {
        warn!(source = %payload.source_do_id, "instance actor unavailable for inbound broadcast");
        return Err((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"success": false}))));
    }

    match reply_rx.await {
        Ok(duplicate) => Ok(Json(BroadcastAck { success: true, duplicate })),
        Err(_) => {
            warn!(source = %payload.source_do_id, "instance actor dropped inbound broadcast reply");
            Err((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"success": false}))))
        }
    }
}

fn authorized(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == expected_token)
        .unwrap_or(false)
}
