//! Environment-driven configuration for a relay instance.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

fn env_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_u64_set(key: &str) -> HashSet<u64> {
    env_list(key).into_iter().filter_map(|s| s.parse().ok()).collect()
}

/// Reserved kind used for auth-challenge responses (NIP-42 style `kind 22242`
/// in the protocol this relay's wire format is modeled on).
pub const AUTH_RESPONSE_KIND: u64 = 22242;

/// Kind exempted from the author-blocklist moderation check (gift-wrapped
/// direct messages in the protocol this is modeled on, `kind 1059`).
pub const GIFT_WRAP_KIND: u64 = 1059;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl RateLimitConfig {
    fn from_env(rate_key: &str, capacity_key: &str, default_rate: f64, default_capacity: u32) -> Self {
        Self {
            capacity: env_var(capacity_key, default_capacity),
            refill_per_sec: env_var(rate_key, default_rate),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModerationConfig {
    pub blocked_pubkeys: HashSet<String>,
    pub allowed_kinds: Option<HashSet<u64>>,
    pub blocked_content_substrings: Vec<String>,
    pub allowed_tag_names: Option<HashSet<String>>,
}

impl ModerationConfig {
    fn from_env() -> Self {
        let allowed_kinds = std::env::var("MODERATION_ALLOWED_KINDS")
            .ok()
            .map(|v| v.split(',').filter_map(|s| s.trim().parse().ok()).collect());
        let allowed_tag_names = std::env::var("MODERATION_ALLOWED_TAGS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect());
        Self {
            blocked_pubkeys: env_list("MODERATION_BLOCKED_PUBKEYS").into_iter().collect(),
            allowed_kinds,
            blocked_content_substrings: env_list("MODERATION_BLOCKED_CONTENT"),
            allowed_tag_names,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub region: String,
    pub colo: String,
    pub do_name: String,

    pub publish_rate_limit: RateLimitConfig,
    pub subscribe_rate_limit: RateLimitConfig,
    pub excluded_rate_limit_kinds: HashSet<u64>,

    pub pay_to_relay_enabled: bool,
    pub payment_cache_cap: usize,
    pub payment_cache_ttl: Duration,

    pub auth_required: bool,
    pub auth_timeout: Duration,

    pub regional_endpoints: Vec<String>,
    pub endpoint_hints: HashMap<String, String>,
    pub internal_broadcast_token: String,
    pub broadcast_timeout: Duration,

    pub moderation: ModerationConfig,

    pub historical_replay_cap: usize,
    pub query_cache_ttl: Duration,
    pub query_cache_size: usize,
    pub idle_timeout: Duration,
    pub dedup_retention: Duration,

    pub max_frame_bytes: usize,
    pub max_sub_id_len: usize,
    pub forbidden_subscribe_kinds: HashSet<u64>,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self {
            region: std::env::var("REGION").unwrap_or_else(|_| "unknown".to_string()),
            colo: std::env::var("COLO").unwrap_or_else(|_| "unknown".to_string()),
            do_name: std::env::var("DO_NAME").unwrap_or_else(|_| "default".to_string()),

            publish_rate_limit: RateLimitConfig::from_env(
                "PUBKEY_RATE_LIMIT_REFILL",
                "PUBKEY_RATE_LIMIT_CAPACITY",
                10.0,
                20,
            ),
            subscribe_rate_limit: RateLimitConfig::from_env(
                "REQ_RATE_LIMIT_REFILL",
                "REQ_RATE_LIMIT_CAPACITY",
                5.0,
                10,
            ),
            excluded_rate_limit_kinds: env_u64_set("EXCLUDED_RATE_LIMIT_KINDS"),

            pay_to_relay_enabled: env_var("PAY_TO_RELAY_ENABLED", false),
            payment_cache_cap: env_var("PAYMENT_CACHE_CAP", 1000usize),
            payment_cache_ttl: Duration::from_secs(env_var("PAYMENT_CACHE_TTL_SECONDS", 3600u64)),

            auth_required: env_var("AUTH_REQUIRED", false),
            auth_timeout: Duration::from_millis(env_var("AUTH_TIMEOUT_MS", 600_000u64)),

            regional_endpoints: env_list("REGIONAL_ENDPOINTS"),
            endpoint_hints: parse_endpoint_hints(),
            internal_broadcast_token: std::env::var("INTERNAL_BROADCAST_TOKEN")
                .unwrap_or_else(|_| "dev-broadcast-token".to_string()),
            broadcast_timeout: Duration::from_secs(3),

            moderation: ModerationConfig::from_env(),

            historical_replay_cap: env_var("HISTORICAL_REPLAY_CAP", 500usize),
            query_cache_ttl: Duration::from_secs(env_var("QUERY_CACHE_TTL_SECONDS", 60u64)),
            query_cache_size: env_var("QUERY_CACHE_SIZE", 100usize),
            idle_timeout: Duration::from_secs(env_var("IDLE_TIMEOUT_SECONDS", 300u64)),
            dedup_retention: Duration::from_secs(env_var("DEDUP_RETENTION_SECONDS", 300u64)),

            max_frame_bytes: 65_536,
            max_sub_id_len: 64,
            forbidden_subscribe_kinds: {
                let mut set = env_u64_set("FORBIDDEN_SUBSCRIBE_KINDS");
                set.insert(AUTH_RESPONSE_KIND);
                set
            },
        }
    }
}

fn parse_endpoint_hints() -> HashMap<String, String> {
    std::env::var("ENDPOINT_HINTS")
        .ok()
        .map(|v| {
            v.split(',')
                .filter_map(|pair| {
                    let mut parts = pair.splitn(2, '=');
                    let name = parts.next()?.trim();
                    let hint = parts.next()?.trim();
                    if name.is_empty() || hint.is_empty() {
                        None
                    } else {
                        Some((name.to_string(), hint.to_string()))
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}
