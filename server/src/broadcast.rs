//! Broadcast Fabric: local fan-out plus cross-region fan-out with duplicate
//! suppression.
//!
//! Broadcast is a read-only consumer of the session map — this avoids a
//! cyclic reference between it and the Registry: it never owns or mutates
//! sessions, it only enumerates them and pushes matched frames into each
//! session's outbox.
//!
//! Cross-region fan-out is a fire-and-forget POST against sibling
//! `/do-broadcast` endpoints, classifying errors as retryable or not.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::Event;
use crate::instance::matching::filter_list_matches;
use crate::protocol::ServerFrame;
use crate::session::Session;

#[derive(Debug, Serialize)]
struct BroadcastRequest<'a> {
    event: &'a Event,
    #[serde(rename = "sourceDoId")]
    source_do_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub duplicate: bool,
}

pub struct BroadcastFabric {
    http: Client,
    timeout: Duration,
    instance_name: String,
    sibling_endpoints: Vec<String>,
    internal_token: String,
}

impl BroadcastFabric {
    pub fn new(instance_name: String, sibling_endpoints: Vec<String>, internal_token: String, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("relaycore/1.0")
            .build()
            .expect("failed to build HTTP client");
        Self { http, timeout, instance_name, sibling_endpoints, internal_token }
    }

    /// Enumerates every live session owned by this instance and emits
    /// `["EVENT", sub-id, event]` for every subscription whose filters
    /// match. Send errors are logged, never fatal.
    pub fn fan_out_local(&self, sessions: &HashMap<String, Session>, event: &Event) {
        for session in sessions.values() {
            for (sub_id, filters) in &session.subscriptions {
                if filter_list_matches(filters, event) {
                    session.send(ServerFrame::Event { sub_id: sub_id.clone(), event: event.clone() });
                }
            }
        }
    }

    /// POSTs the event to every sibling instance (excluding self), 3s
    /// timeout each, independent, fire-and-forget: no sibling failure
    /// rejects the publish.
    pub fn fan_out_cross_region(&self, event: Event) {
        for endpoint in &self.sibling_endpoints {
            if endpoint == &self.instance_name {
                continue;
            }
            crate::metrics::record_broadcast_cross_region();
            let http = self.http.clone();
            let timeout = self.timeout;
            let token = self.internal_token.clone();
            let source = self.instance_name.clone();
            let endpoint = endpoint.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let body = BroadcastRequest { event: &event, source_do_id: &source };
                let url = format!("{}/do-broadcast", endpoint.trim_end_matches('/'));
                let result = http
                    .post(&url)
                    .timeout(timeout)
                    .bearer_auth(token)
                    .json(&body)
                    .send()
                    .await;
                match result {
                    Ok(resp) => {
                        if !resp.status().is_success() {
                            warn!(endpoint = %endpoint, status = %resp.status(), "sibling broadcast rejected");
                        } else {
                            debug!(endpoint = %endpoint, "sibling broadcast delivered");
                        }
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "sibling broadcast failed (ignored, fire-and-forget)");
                    }
                }
            });
        }
    }
}
