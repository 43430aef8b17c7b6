//! Lifecycle Timer: on every idle tick, if no sockets remain attached,
//! flushes the instance's in-memory caches and prunes persisted
//! subscriptions left behind by sessions nobody is going to rehydrate.

use tracing::{info, warn};

use super::dedup::DedupMap;
use super::payment::PaymentCache;
use super::query_cache::QueryCache;
use super::InstanceState;

pub async fn on_alarm(state: &mut InstanceState) {
    if !state.sessions.is_empty() {
        return;
    }

    info!(instance = %state.config.do_name, "idle tick: no attached sockets, flushing caches");
    state.query_cache = QueryCache::new(state.config.query_cache_ttl, state.config.query_cache_size);
    state.dedup = DedupMap::new(state.config.dedup_retention);
    state.payment_cache = PaymentCache::new(state.config.payment_cache_ttl, state.config.payment_cache_cap);

    prune_orphaned_subscriptions(state).await;
}

/// Deletes persisted subscription records whose session id does not
/// correspond to any currently attached socket.
async fn prune_orphaned_subscriptions(state: &InstanceState) {
    let ids = match state.state_store.all_session_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "failed to list session ids for orphan pruning");
            return;
        }
    };

    for id in ids {
        if state.sessions.contains_key(&id) {
            continue;
        }
        if let Err(e) = state.state_store.delete_subscriptions(&id).await {
            warn!(session_id = %id, error = %e, "failed to prune orphaned subscription");
        }
    }
}
