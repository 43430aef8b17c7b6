//! Admission Pipeline: the eight ordered checks an inbound `EVENT` frame
//! must pass before it is written and fanned out. The first failing step
//! short-circuits with its reason string; exactly one `OK` is always sent
//! for an `EVENT`, before any broadcast fan-out begins.

use tracing::warn;

use crate::config::AUTH_RESPONSE_KIND;
use crate::error::RelayError;
use crate::event::Event;
use crate::protocol::ServerFrame;

use super::{moderation, InstanceState};

/// Runs the full pipeline for one inbound `EVENT` and sends exactly one `OK`
/// reply. On success, also performs the post-write side effects (bookmark
/// update, dedup record, cache invalidation) and then fans the event out —
/// strictly after the `OK` has already been queued.
pub async fn handle_event(state: &mut InstanceState, session_id: &str, event: Event) {
    match admit(state, session_id, &event).await {
        Ok(()) => {
            crate::metrics::record_event_admitted();
            reply_ok(state, session_id, &event.id, true, String::new());
            state.broadcast.fan_out_local(&state.sessions, &event);
            state.broadcast.fan_out_cross_region(event);
        }
        Err(e) => {
            crate::metrics::record_event_rejected("admission");
            reply_ok(state, session_id, &event.id, false, e.reason());
        }
    }
}

fn reply_ok(state: &InstanceState, session_id: &str, event_id: &str, accepted: bool, reason: String) {
    if let Some(session) = state.sessions.get(session_id) {
        session.send(ServerFrame::Ok { event_id: event_id.to_string(), accepted, reason });
    }
}

async fn admit(state: &mut InstanceState, session_id: &str, event: &Event) -> Result<(), RelayError> {
    // 1. Shape check — well-formed hex id/pubkey/sig and a self-consistent id.
    if !(event.has_hex_id() && event.has_hex_pubkey() && event.has_hex_sig()) {
        return Err(RelayError::invalid("malformed event fields"));
    }
    if !event.id_is_consistent() {
        return Err(RelayError::invalid("id does not match its canonical hash"));
    }

    // 2. Reserved-kind check — auth responses never travel the EVENT path.
    if event.kind == AUTH_RESPONSE_KIND {
        return Err(RelayError::invalid("reserved kind"));
    }

    // 3. Auth check.
    if state.config.auth_required {
        let authed = state
            .sessions
            .get(session_id)
            .map(|s| s.is_authenticated_as(&event.pubkey))
            .unwrap_or(false);
        if !authed {
            return Err(RelayError::AuthRequired);
        }
    }

    // 4. Rate-limit check, skipped for kinds the operator excluded.
    if !state.config.excluded_rate_limit_kinds.contains(&event.kind) {
        let allowed = state
            .sessions
            .get_mut(session_id)
            .map(|s| s.publish_limiter.try_consume())
            .unwrap_or(false);
        if !allowed {
            return Err(RelayError::RateLimited);
        }
    }

    // 5. Signature check.
    if !state.verifier.verify(&event.id, &event.pubkey, &event.sig) {
        return Err(RelayError::invalid("signature verification failed"));
    }

    // 6. Payment check.
    if state.config.pay_to_relay_enabled {
        let paid = state.payment_cache.has_paid(state.payment_oracle.as_ref(), &event.pubkey).await;
        if !paid {
            return Err(RelayError::blocked("payment required"));
        }
    }

    // 7. Moderation.
    moderation::check(&state.config.moderation, event)?;

    // 8. Storage write, then the side effects that ride along with a
    // successful admission.
    let bookmark = state.event_store.write(event).await.map_err(|e| {
        warn!(event_id = %event.id, error = %e, "storage write failed");
        RelayError::internal("database error")
    })?;

    if let Some(session) = state.sessions.get_mut(session_id) {
        session.bookmark = Some(bookmark.0.clone());
    }
    state.dedup.record(&event.id);
    state.query_cache.invalidate(event.kind, &event.pubkey);

    Ok(())
}
