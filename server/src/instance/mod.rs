//! The Relay Instance: a single `ractor::Actor` owning every piece of
//! per-instance state — connection sessions, the query cache, the dedup
//! map, the payment cache, and the storage/broadcast collaborators. One
//! actor per relay instance rather than one per conversation; the "all
//! messages processed sequentially through the mailbox" property is what
//! keeps the actor race-free without any in-instance locking.

pub mod admission;
pub mod auth_handshake;
pub mod dedup;
pub mod lifecycle;
pub mod matching;
pub mod messages;
pub mod moderation;
pub mod payment;
pub mod query_cache;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broadcast::BroadcastFabric;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::event::Event;
use crate::instance::payment::PaymentOracle;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::session::{Session, SessionAttachment, TokenBucket};
use crate::signing::SignatureVerifier;
use crate::storage::{EventStore, InstanceStateStore};

use self::dedup::DedupMap;
use self::payment::PaymentCache;
use self::query_cache::QueryCache;

pub use messages::InstanceMessage;

/// A handle callers use to talk to the instance actor.
pub type InstanceHandle = ActorRef<InstanceMessage>;

/// State owned exclusively by the instance actor's mailbox — never shared,
/// never locked.
pub struct InstanceState {
    pub config: Arc<RelayConfig>,
    pub sessions: HashMap<String, Session>,
    pub query_cache: QueryCache,
    pub dedup: DedupMap,
    pub payment_cache: PaymentCache,
    pub event_store: Arc<dyn EventStore>,
    pub state_store: Arc<dyn InstanceStateStore>,
    pub payment_oracle: Arc<dyn PaymentOracle>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub broadcast: Arc<BroadcastFabric>,
}

pub struct RelayInstanceActor;

pub struct RelayInstanceArgs {
    pub config: Arc<RelayConfig>,
    pub event_store: Arc<dyn EventStore>,
    pub state_store: Arc<dyn InstanceStateStore>,
    pub payment_oracle: Arc<dyn PaymentOracle>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub broadcast: Arc<BroadcastFabric>,
}

#[async_trait]
impl Actor for RelayInstanceActor {
    type Msg = InstanceMessage;
    type State = InstanceState;
    type Arguments = RelayInstanceArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(instance = %args.config.do_name, region = %args.config.region, "relay instance starting");

        let idle_timeout = args.config.idle_timeout;
        let alarm_actor = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(idle_timeout);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if alarm_actor.cast(InstanceMessage::Alarm).is_err() {
                    break;
                }
            }
        });

        Ok(InstanceState {
            query_cache: QueryCache::new(args.config.query_cache_ttl, args.config.query_cache_size),
            dedup: DedupMap::new(args.config.dedup_retention),
            payment_cache: PaymentCache::new(args.config.payment_cache_ttl, args.config.payment_cache_cap),
            sessions: HashMap::new(),
            config: args.config,
            event_store: args.event_store,
            state_store: args.state_store,
            payment_oracle: args.payment_oracle,
            verifier: args.verifier,
            broadcast: args.broadcast,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            InstanceMessage::Rehydrate { attachment, outbox, reply } => {
                attach_session(state, attachment, outbox).await;
                let _ = reply.send(());
            }
            InstanceMessage::Frame { attachment, outbox, frame, reply } => {
                attach_session(state, attachment.clone(), outbox).await;
                dispatch_frame(state, &attachment.session_id, frame).await;
                let _ = reply.send(());
            }
            InstanceMessage::Disconnect { session_id } => {
                detach_session(state, &session_id);
            }
            InstanceMessage::InboundBroadcast { event, reply } => {
                let duplicate = !state.dedup.record_if_new(&event.id);
                if duplicate {
                    crate::metrics::record_broadcast_duplicate();
                } else {
                    state.broadcast.fan_out_local(&state.sessions, &event);
                }
                let _ = reply.send(duplicate);
            }
            InstanceMessage::Alarm => {
                lifecycle::on_alarm(state).await;
            }
        }
        Ok(())
    }
}

async fn dispatch_frame(state: &mut InstanceState, session_id: &str, frame: ClientFrame) {
    match frame {
        ClientFrame::Event(event) => admission::handle_event(state, session_id, event).await,
        ClientFrame::Req { sub_id, filters } => registry::handle_req(state, session_id, sub_id, filters).await,
        ClientFrame::Close { sub_id } => registry::handle_close(state, session_id, sub_id).await,
        ClientFrame::Auth(event) => handle_auth(state, session_id, event).await,
    }
}

/// Validates a signed `AUTH` response against the session's issued challenge
/// and replies `OK` with the outcome.
async fn handle_auth(state: &mut InstanceState, session_id: &str, event: Event) {
    let Some((host, challenge)) = state
        .sessions
        .get(session_id)
        .map(|s| (s.host.clone(), s.auth_challenge.clone()))
    else {
        return;
    };

    let result = match challenge {
        Some(challenge) => {
            let now = chrono::Utc::now().timestamp();
            auth_handshake::validate(state.verifier.as_ref(), &event, &challenge, &host, now, state.config.auth_timeout)
        }
        None => Err(RelayError::invalid("no auth challenge issued")),
    };

    match result {
        Ok(()) => {
            if let Some(session) = state.sessions.get_mut(session_id) {
                session.authenticated_keys.insert(event.pubkey.clone());
            }
            if let Some(session) = state.sessions.get(session_id) {
                session.send(ServerFrame::Ok { event_id: event.id, accepted: true, reason: String::new() });
            }
        }
        Err(e) => {
            if let Some(session) = state.sessions.get(session_id) {
                session.send(ServerFrame::Ok { event_id: event.id, accepted: false, reason: e.reason() });
            }
        }
    }
}

/// Registers a session if it isn't already attached, loading any persisted
/// subscriptions and issuing a fresh auth challenge. Idempotent.
async fn attach_session(state: &mut InstanceState, attachment: SessionAttachment, outbox: mpsc::UnboundedSender<ServerFrame>) {
    if state.sessions.contains_key(&attachment.session_id) {
        return;
    }

    let mut session = Session::new(
        attachment.session_id.clone(),
        attachment.host.clone(),
        attachment.instance_name.clone(),
        TokenBucket::new(state.config.publish_rate_limit.capacity, state.config.publish_rate_limit.refill_per_sec),
        TokenBucket::new(state.config.subscribe_rate_limit.capacity, state.config.subscribe_rate_limit.refill_per_sec),
        outbox,
    );
    session.bookmark = attachment.bookmark.clone();

    match state.state_store.load_subscriptions(&attachment.session_id).await {
        Ok(persisted) => {
            for sub in persisted {
                session.subscriptions.insert(sub.sub_id, sub.filters);
            }
        }
        Err(e) => warn!(session_id = %attachment.session_id, error = %e, "failed to load persisted subscriptions"),
    }

    if state.config.auth_required {
        let challenge = auth_handshake::issue_challenge();
        session.send(ServerFrame::Auth { challenge: challenge.clone() });
        session.auth_challenge = Some(challenge);
    }

    state.sessions.insert(attachment.session_id.clone(), session);
}

/// Removes in-memory session state and purges its persisted subscriptions.
/// A close or error deletes durable state, unlike an idle-flush, which only
/// drops the in-memory half.
fn detach_session(state: &mut InstanceState, session_id: &str) {
    state.sessions.remove(session_id);
    let store = state.state_store.clone();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = store.delete_subscriptions(&session_id).await {
            warn!(session_id = %session_id, error = %e, "failed to purge persisted subscriptions");
        }
    });
}

/// Starts a relay instance actor under the given registered name.
pub async fn spawn(name: String, args: RelayInstanceArgs) -> Result<InstanceHandle, ractor::SpawnErr> {
    let (actor_ref, _join) = Actor::spawn(Some(name), RelayInstanceActor, args).await?;
    Ok(actor_ref)
}
