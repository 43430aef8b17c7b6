//! WebSocket upgrade handler and the hibernation-aware per-connection loop.
//!
//! Splits each connection's sender/receiver halves and spawns writer/reader/
//! heartbeat tasks joined with `tokio::select!`. All subscription matching
//! lives in the instance actor — this module's only job is turning
//! WebSocket frames into `InstanceMessage`s and turning the session's
//! outbox back into frames.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::instance::{InstanceHandle, InstanceMessage};
use crate::middleware::size_guard::exceeds_cap;
use crate::protocol::{parse_client_frame, ServerFrame};
use crate::session::SessionAttachment;

/// Server-side heartbeat interval.
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct UpgradeQuery {
    region: Option<String>,
    colo: Option<String>,
    #[serde(rename = "doName")]
    do_name: Option<String>,
}

/// Upgrades to a WebSocket and hands the connection off to [`handle_socket`].
///
/// A request missing the `Upgrade: websocket` handshake headers is reported
/// as `426 Upgrade Required` rather than axum's default `400`, since that's
/// the protocol-correct status for "this endpoint only serves upgrades".
pub async fn upgrade(
    State(instance): State<InstanceHandle>,
    State(config): State<Arc<RelayConfig>>,
    Query(params): Query<UpgradeQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(_) => {
            return (StatusCode::UPGRADE_REQUIRED, "expected a WebSocket upgrade request").into_response();
        }
    };

    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let region = params.region.unwrap_or_else(|| "unknown".to_string());
    let colo = params.colo.unwrap_or_else(|| "unknown".to_string());
    let instance_name = params.do_name.unwrap_or(config.do_name.clone());
    let session_id = uuid::Uuid::new_v4().to_string();

    info!(%session_id, %region, %colo, %instance_name, "websocket upgrade accepted");

    let max_frame_bytes = config.max_frame_bytes;
    ws.on_upgrade(move |socket| handle_socket(socket, instance, max_frame_bytes, session_id, host, instance_name))
}

async fn handle_socket(
    socket: WebSocket,
    instance: InstanceHandle,
    max_frame_bytes: usize,
    session_id: String,
    host: String,
    instance_name: String,
) {
    let (sink, mut stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let attachment = SessionAttachment {
        session_id: session_id.clone(),
        bookmark: None,
        host,
        instance_name,
        has_paid: None,
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if instance
        .send_message(InstanceMessage::Rehydrate { attachment: attachment.clone(), outbox: outbox_tx.clone(), reply: reply_tx })
        .is_err()
    {
        warn!(%session_id, "instance actor unavailable at upgrade time");
        return;
    }
    if reply_rx.await.is_err() {
        warn!(%session_id, "instance actor dropped rehydrate reply");
        return;
    }

    let writer_sink = sink.clone();
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            let mut guard = writer_sink.lock().await;
            if guard.send(Message::Text(frame.to_text().into())).await.is_err() {
                break;
            }
        }
    });

    let reader_instance = instance.clone();
    let reader_session_id = session_id.clone();
    let reader_attachment = attachment.clone();
    let reader_notices = outbox_tx.clone();
    let mut reader_task = tokio::spawn(async move {
        while let Some(next) = stream.next().await {
            let message = match next {
                Ok(m) => m,
                Err(e) => {
                    debug!(session_id = %reader_session_id, error = %e, "websocket read error");
                    break;
                }
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
            };

            let keep_going = dispatch_text(
                &reader_instance,
                &reader_attachment,
                &reader_notices,
                max_frame_bytes,
                &text,
            )
            .await;
            if !keep_going {
                break;
            }
        }
    });

    let heartbeat_sink = sink.clone();
    let mut heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            let mut guard = heartbeat_sink.lock().await;
            if guard.send(Message::Ping(Vec::new().into())).await.is_err() {
                break;
            }
        }
    });

    // Any one of the three tasks finishing means the connection is over;
    // abort the other two and fall through to cleanup.
    tokio::select! {
        _ = &mut writer_task => { reader_task.abort(); heartbeat_task.abort(); }
        _ = &mut reader_task => { writer_task.abort(); heartbeat_task.abort(); }
        _ = &mut heartbeat_task => { writer_task.abort(); reader_task.abort(); }
    }

    info!(%session_id, "websocket connection closed");
    instance.cast(InstanceMessage::Disconnect { session_id }).ok();
}

/// Enforces the frame-size cap, parses the frame, and — for a well-formed
/// frame — dispatches it to the instance actor and blocks on its reply,
/// which is what gives per-connection FIFO ordering. Returns `false` only
/// when the instance actor itself is gone, signalling the caller to tear
/// the connection down.
async fn dispatch_text(
    instance: &InstanceHandle,
    attachment: &SessionAttachment,
    notices: &mpsc::UnboundedSender<ServerFrame>,
    max_frame_bytes: usize,
    text: &str,
) -> bool {
    if exceeds_cap(text, max_frame_bytes) {
        let _ = notices.send(ServerFrame::notice(format!("frame exceeds {max_frame_bytes} byte limit")));
        return true;
    }

    let frame = match parse_client_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = notices.send(ServerFrame::notice(e.notice_text()));
            return true;
        }
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if instance
        .send_message(InstanceMessage::Frame {
            attachment: attachment.clone(),
            outbox: notices.clone(),
            frame,
            reply: reply_tx,
        })
        .is_err()
    {
        return false;
    }
    reply_rx.await.is_ok()
}
