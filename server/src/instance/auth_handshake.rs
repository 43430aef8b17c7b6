//! Auth Handshake: challenge issuance and signed-response validation.

use std::time::Duration;

use rand::RngCore;

use crate::config::AUTH_RESPONSE_KIND;
use crate::error::RelayError;
use crate::event::Event;
use crate::signing::SignatureVerifier;

/// Fresh 32-byte random challenge, hex-encoded.
pub fn issue_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Extracts the lowercased host from either a full relay URL (`wss://host:port/path`)
/// or a bare `host` / `host:port` string, ignoring the port.
fn host_without_port(host_or_url: &str) -> String {
    let candidate = if host_or_url.contains("://") {
        host_or_url.to_string()
    } else {
        format!("wss://{host_or_url}")
    };
    match url::Url::parse(&candidate) {
        Ok(url) => url.host_str().unwrap_or("").to_ascii_lowercase(),
        Err(_) => String::new(),
    }
}

/// Validates a signed auth-response event against the session's issued
/// challenge and recorded upgrade host. Returns `Ok(())` (and the caller
/// then adds `event.pubkey` to `authenticated_keys`) or a specific
/// `RelayError` with no side effects.
pub fn validate(
    verifier: &dyn SignatureVerifier,
    event: &Event,
    expected_challenge: &str,
    connection_host: &str,
    now_secs: i64,
    freshness_window: Duration,
) -> Result<(), RelayError> {
    if event.kind != AUTH_RESPONSE_KIND {
        return Err(RelayError::invalid("wrong kind for auth response"));
    }

    if !verifier.verify(&event.id, &event.pubkey, &event.sig) {
        return Err(RelayError::invalid("signature verification failed"));
    }

    let skew = (now_secs - event.created_at).unsigned_abs();
    if skew > freshness_window.as_secs() {
        return Err(RelayError::invalid("timestamp skew"));
    }

    let challenge_tag = event
        .indexed_tag_values("challenge")
        .next()
        .ok_or_else(|| RelayError::invalid("missing challenge tag"))?;
    if challenge_tag != expected_challenge {
        return Err(RelayError::invalid("challenge mismatch"));
    }

    let relay_tag = event
        .indexed_tag_values("relay")
        .next()
        .ok_or_else(|| RelayError::invalid("missing relay tag"))?;
    if host_without_port(relay_tag) != host_without_port(connection_host) {
        return Err(RelayError::invalid("relay host mismatch"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::AlwaysValidVerifier;

    fn auth_event(challenge: &str, relay: &str, created_at: i64) -> Event {
        Event {
            id: "a".repeat(64),
            pubkey: "b".repeat(64),
            created_at,
            kind: AUTH_RESPONSE_KIND,
            tags: vec![
                vec!["challenge".to_string(), challenge.to_string()],
                vec!["relay".to_string(), relay.to_string()],
            ],
            content: String::new(),
            sig: "c".repeat(128),
        }
    }

    #[test]
    fn valid_response_accepted() {
        let verifier = AlwaysValidVerifier;
        let event = auth_event("chal123", "wss://relay.example:443/ws", 1000);
        let result = validate(&verifier, &event, "chal123", "relay.example", 1000, Duration::from_secs(60));
        assert!(result.is_ok());
    }

    #[test]
    fn host_mismatch_is_rejected() {
        let verifier = AlwaysValidVerifier;
        let event = auth_event("chal123", "wss://evil.example", 1000);
        let result = validate(&verifier, &event, "chal123", "relay.example", 1000, Duration::from_secs(60));
        assert_eq!(result, Err(RelayError::invalid("relay host mismatch")));
    }

    #[test]
    fn challenge_mismatch_is_rejected() {
        let verifier = AlwaysValidVerifier;
        let event = auth_event("wrong", "relay.example", 1000);
        let result = validate(&verifier, &event, "chal123", "relay.example", 1000, Duration::from_secs(60));
        assert_eq!(result, Err(RelayError::invalid("challenge mismatch")));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let verifier = AlwaysValidVerifier;
        let event = auth_event("chal123", "relay.example", 1000);
        let result = validate(&verifier, &event, "chal123", "relay.example", 10_000, Duration::from_secs(60));
        assert_eq!(result, Err(RelayError::invalid("timestamp skew")));
    }

    #[test]
    fn host_with_and_without_port_are_equivalent() {
        assert_eq!(host_without_port("relay.example:443"), host_without_port("relay.example"));
        assert_eq!(host_without_port("wss://relay.example:443/ws"), "relay.example");
    }
}
