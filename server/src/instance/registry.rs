//! Subscription Registry: `REQ`/`CLOSE` handling, historical replay through
//! the Query Cache, and persistence of the subscription set so it survives
//! hibernation rehydration.

use tracing::warn;

use crate::error::RelayError;
use crate::event::Filter;
use crate::protocol::ServerFrame;
use crate::storage::{Bookmark, PersistedSubscription};

use super::query_cache::{CachedResult, Lookup};
use super::InstanceState;

pub async fn handle_req(state: &mut InstanceState, session_id: &str, sub_id: String, filters: Vec<Filter>) {
    if let Err(e) = validate_shape(state, session_id, &sub_id, &filters) {
        send_closed(state, session_id, sub_id, e);
        return;
    }

    let allowed = state
        .sessions
        .get_mut(session_id)
        .map(|s| s.subscribe_limiter.try_consume())
        .unwrap_or(false);
    if !allowed {
        send_closed(state, session_id, sub_id, RelayError::RateLimited);
        return;
    }

    let clamped = clamp_filters(filters, state.config.historical_replay_cap);

    match state.sessions.get_mut(session_id) {
        Some(session) => {
            session.subscriptions.insert(sub_id.clone(), clamped.clone());
        }
        None => return,
    }
    persist_subscriptions(state, session_id).await;

    match resolve_historical(state, session_id, &clamped).await {
        Ok(events) => {
            crate::metrics::record_subscription_opened();
            if let Some(session) = state.sessions.get(session_id) {
                for event in events {
                    session.send(ServerFrame::Event { sub_id: sub_id.clone(), event });
                }
                session.send(ServerFrame::Eose { sub_id });
            }
        }
        Err(e) => {
            if let Some(session) = state.sessions.get_mut(session_id) {
                session.subscriptions.remove(&sub_id);
            }
            persist_subscriptions(state, session_id).await;
            send_closed(state, session_id, sub_id, e);
        }
    }
}

pub async fn handle_close(state: &mut InstanceState, session_id: &str, sub_id: String) {
    let removed = state
        .sessions
        .get_mut(session_id)
        .map(|s| s.subscriptions.remove(&sub_id).is_some())
        .unwrap_or(false);

    if removed {
        persist_subscriptions(state, session_id).await;
        crate::metrics::record_subscription_closed();
    }

    let reason = if removed { RelayError::Closed } else { RelayError::NotFound };
    send_closed(state, session_id, sub_id, reason);
}

fn send_closed(state: &InstanceState, session_id: &str, sub_id: String, err: RelayError) {
    if let Some(session) = state.sessions.get(session_id) {
        session.send(ServerFrame::Closed { sub_id, reason: err.reason() });
    }
}

fn validate_shape(
    state: &InstanceState,
    session_id: &str,
    sub_id: &str,
    filters: &[Filter],
) -> Result<(), RelayError> {
    if sub_id.is_empty() || sub_id.len() > state.config.max_sub_id_len {
        return Err(RelayError::invalid("sub-id length"));
    }

    let session = state
        .sessions
        .get(session_id)
        .ok_or_else(|| RelayError::internal("session missing"))?;
    if state.config.auth_required && session.authenticated_keys.is_empty() {
        return Err(RelayError::AuthRequired);
    }

    for filter in filters {
        if let Some(kinds) = &filter.kinds {
            if kinds.iter().any(|k| state.config.forbidden_subscribe_kinds.contains(k)) {
                return Err(RelayError::invalid("forbidden kind in filter"));
            }
        }
    }

    Ok(())
}

/// Clamps every filter's `limit` to the historical replay cap, defaulting to
/// the cap when a filter doesn't name one.
fn clamp_filters(filters: Vec<Filter>, cap: usize) -> Vec<Filter> {
    filters
        .into_iter()
        .map(|mut f| {
            let requested = f.limit.unwrap_or(cap as u64);
            f.limit = Some(requested.min(cap as u64));
            f
        })
        .collect()
}

/// The bound to pass to the storage backend: the largest per-filter `limit`
/// among the (already-clamped) filters, so no single filter's requested
/// count gets truncated below what `clamp_filters` allowed it to keep.
fn effective_limit(filters: &[Filter], cap: usize) -> usize {
    filters
        .iter()
        .filter_map(|f| f.limit)
        .max()
        .map(|l| l as usize)
        .unwrap_or(cap)
        .min(cap)
}

async fn persist_subscriptions(state: &InstanceState, session_id: &str) {
    let Some(session) = state.sessions.get(session_id) else { return };
    let persisted: Vec<PersistedSubscription> = session
        .subscriptions
        .iter()
        .map(|(sub_id, filters)| PersistedSubscription { sub_id: sub_id.clone(), filters: filters.clone() })
        .collect();
    if let Err(e) = state.state_store.save_subscriptions(session_id, &persisted).await {
        warn!(session_id, error = %e, "failed to persist subscriptions");
    }
}

/// Consults the Query Cache keyed on (filters, session bookmark), falling
/// back to the storage backend on miss.
async fn resolve_historical(
    state: &mut InstanceState,
    session_id: &str,
    filters: &[Filter],
) -> Result<Vec<crate::event::Event>, RelayError> {
    let bookmark = state.sessions.get(session_id).and_then(|s| s.bookmark.clone()).map(Bookmark);
    let key = super::query_cache::cache_key(filters, bookmark.as_ref());
    let limit = effective_limit(filters, state.config.historical_replay_cap);

    match state.query_cache.begin_lookup(&key) {
        Lookup::Hit(result) => Ok(result.events),
        Lookup::Wait(rx) => rx.await.map(|r| r.events).map_err(|_| RelayError::internal("database error")),
        Lookup::Miss => match state.event_store.query(filters, bookmark.as_ref(), limit).await {
            Ok(qr) => {
                let result = CachedResult { events: qr.events.clone(), bookmark: qr.bookmark };
                state.query_cache.complete(&key, filters, result);
                Ok(qr.events)
            }
            Err(e) => {
                warn!(error = %e, "historical query failed");
                state.query_cache.fail(&key);
                Err(RelayError::internal("database error"))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::broadcast::BroadcastFabric;
    use crate::instance::dedup::DedupMap;
    use crate::instance::payment::{AlwaysUnpaidOracle, PaymentCache};
    use crate::instance::query_cache::QueryCache;
    use crate::session::{Session, TokenBucket};
    use crate::signing::AlwaysValidVerifier;
    use crate::storage::memory::{MemoryEventStore, MemoryInstanceStateStore};

    use super::*;

    fn test_state() -> (InstanceState, mpsc::UnboundedReceiver<ServerFrame>, String) {
        let config = crate::config::RelayConfig::from_env();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(
            "sess1".into(),
            "relay.example".into(),
            config.do_name.clone(),
            TokenBucket::new(20, 10.0),
            TokenBucket::new(10, 5.0),
            tx,
        );
        let mut sessions = std::collections::HashMap::new();
        let session_id = session.id.clone();
        sessions.insert(session_id.clone(), session);

        let state = InstanceState {
            config: Arc::new(config),
            sessions,
            query_cache: QueryCache::new(Duration::from_secs(60), 100),
            dedup: DedupMap::new(Duration::from_secs(300)),
            payment_cache: PaymentCache::new(Duration::from_secs(60), 100),
            event_store: Arc::new(MemoryEventStore::new()),
            state_store: Arc::new(MemoryInstanceStateStore::new()),
            payment_oracle: Arc::new(AlwaysUnpaidOracle),
            verifier: Arc::new(AlwaysValidVerifier),
            broadcast: Arc::new(BroadcastFabric::new("do-a".into(), vec![], "tok".into(), Duration::from_secs(3))),
        };
        (state, rx, session_id)
    }

    #[tokio::test]
    async fn req_replays_then_emits_eose() {
        let (mut state, mut rx, session_id) = test_state();
        handle_req(&mut state, &session_id, "sub1".into(), vec![Filter::default()]).await;
        match rx.try_recv().unwrap() {
            ServerFrame::Eose { sub_id } => assert_eq!(sub_id, "sub1"),
            other => panic!("expected EOSE with no historical events, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_sub_id_is_rejected() {
        let (mut state, mut rx, session_id) = test_state();
        handle_req(&mut state, &session_id, String::new(), vec![Filter::default()]).await;
        match rx.try_recv().unwrap() {
            ServerFrame::Closed { reason, .. } => assert!(reason.starts_with("invalid:")),
            other => panic!("expected CLOSED, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forbidden_kind_filter_is_rejected() {
        let (mut state, mut rx, session_id) = test_state();
        let forbidden = *state.config.forbidden_subscribe_kinds.iter().next().unwrap();
        let filter = Filter { kinds: Some(HashSet::from([forbidden])), ..Default::default() };
        handle_req(&mut state, &session_id, "sub1".into(), vec![filter]).await;
        match rx.try_recv().unwrap() {
            ServerFrame::Closed { reason, .. } => assert_eq!(reason, "invalid: forbidden kind in filter"),
            other => panic!("expected CLOSED, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_on_unknown_sub_id_reports_not_found() {
        let (mut state, mut rx, session_id) = test_state();
        handle_close(&mut state, &session_id, "never-subscribed".into()).await;
        match rx.try_recv().unwrap() {
            ServerFrame::Closed { reason, .. } => assert_eq!(reason, "not found"),
            other => panic!("expected CLOSED, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_on_known_sub_id_reports_closed_and_removes_it() {
        let (mut state, mut rx, session_id) = test_state();
        handle_req(&mut state, &session_id, "sub1".into(), vec![Filter::default()]).await;
        let _ = rx.try_recv(); // drain EOSE

        handle_close(&mut state, &session_id, "sub1".into()).await;
        match rx.try_recv().unwrap() {
            ServerFrame::Closed { reason, .. } => assert_eq!(reason, "closed"),
            other => panic!("expected CLOSED, got {other:?}"),
        }
        assert!(!state.sessions.get(&session_id).unwrap().subscriptions.contains_key("sub1"));
    }

    #[tokio::test]
    async fn limit_is_clamped_to_historical_replay_cap() {
        let (mut state, mut rx, session_id) = test_state();
        let cap = state.config.historical_replay_cap as u64;
        let filter = Filter { limit: Some(cap + 1000), ..Default::default() };
        handle_req(&mut state, &session_id, "sub1".into(), vec![filter]).await;
        let _ = rx.try_recv();
        let stored = &state.sessions.get(&session_id).unwrap().subscriptions["sub1"];
        assert_eq!(stored[0].limit, Some(cap));
    }

    #[tokio::test]
    async fn a_small_requested_limit_actually_bounds_the_replayed_events() {
        let (mut state, mut rx, session_id) = test_state();
        for kind in 0..5u64 {
            let event = crate::event::Event {
                id: format!("{:064x}", kind),
                pubkey: "a".repeat(64),
                created_at: 100 + kind as i64,
                kind: 1,
                tags: vec![],
                content: "hi".into(),
                sig: "b".repeat(128),
            };
            state.event_store.write(&event).await.unwrap();
        }

        let filter = Filter { kinds: Some(HashSet::from([1u64])), limit: Some(2), ..Default::default() };
        handle_req(&mut state, &session_id, "sub1".into(), vec![filter]).await;

        let mut delivered = 0;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                ServerFrame::Event { .. } => delivered += 1,
                ServerFrame::Eose { .. } => break,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(delivered, 2, "a limit of 2 must not replay all 5 matching events");
    }
}
