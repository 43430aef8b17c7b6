//! Per-connection session state and the hibernation attachment blob.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::event::Filter;
use crate::protocol::ServerFrame;

/// Token-bucket rate limiter: fixed capacity, refilled at a steady rate.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    pub fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        self.last_refill = now;
    }
}

/// Small serializable header carried alongside the socket so a session can
/// be rehydrated after hibernation without keeping the full session in
/// memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAttachment {
    pub session_id: String,
    pub bookmark: Option<String>,
    pub host: String,
    pub instance_name: String,
    pub has_paid: Option<bool>,
}

/// Per-connection mutable state, owned exclusively by the instance actor
/// that accepted the connection.
pub struct Session {
    pub id: String,
    pub host: String,
    pub instance_name: String,
    pub subscriptions: HashMap<String, Vec<Filter>>,
    pub publish_limiter: TokenBucket,
    pub subscribe_limiter: TokenBucket,
    pub bookmark: Option<String>,
    pub auth_challenge: Option<String>,
    pub authenticated_keys: HashSet<String>,
    /// Channel the instance actor pushes outbound frames into; the socket
    /// writer task drains it. Absent session transiently during rehydration.
    pub outbox: mpsc::UnboundedSender<ServerFrame>,
}

impl Session {
    pub fn new(
        id: String,
        host: String,
        instance_name: String,
        publish_limiter: TokenBucket,
        subscribe_limiter: TokenBucket,
        outbox: mpsc::UnboundedSender<ServerFrame>,
    ) -> Self {
        Self {
            id,
            host,
            instance_name,
            subscriptions: HashMap::new(),
            publish_limiter,
            subscribe_limiter,
            bookmark: None,
            auth_challenge: None,
            authenticated_keys: HashSet::new(),
            outbox,
        }
    }

    pub fn attachment(&self) -> SessionAttachment {
        SessionAttachment {
            session_id: self.id.clone(),
            bookmark: self.bookmark.clone(),
            host: self.host.clone(),
            instance_name: self.instance_name.clone(),
            has_paid: None,
        }
    }

    pub fn send(&self, frame: ServerFrame) {
        // Outbox send errors mean the socket writer has already gone away;
        // the connection-death cleanup path will remove this session shortly.
        let _ = self.outbox.send(frame);
    }

    pub fn is_authenticated_as(&self, pubkey: &str) -> bool {
        self.authenticated_keys.contains(pubkey)
    }
}
