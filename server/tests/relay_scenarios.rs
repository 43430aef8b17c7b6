//! End-to-end tests driving the instance actor the way a real connection
//! would: rehydrate, send frames, read the outbox. Each test spins up its
//! own actor (and, for the cross-region test, its own HTTP listener) against
//! the in-memory storage backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use axum::routing::post;
use axum::Router;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use relaycore_server::broadcast::BroadcastFabric;
use relaycore_server::broadcast_endpoint;
use relaycore_server::config::RelayConfig;
use relaycore_server::event::{Event, Filter};
use relaycore_server::instance::payment::AlwaysUnpaidOracle;
use relaycore_server::instance::{self, InstanceHandle, InstanceMessage, RelayInstanceArgs};
use relaycore_server::protocol::{ClientFrame, ServerFrame};
use relaycore_server::session::SessionAttachment;
use relaycore_server::signing::AlwaysValidVerifier;
use relaycore_server::storage::memory::{MemoryEventStore, MemoryInstanceStateStore};

fn signed_event(kind: u64, pubkey: &str, content: &str, tags: Vec<Vec<String>>) -> Event {
    let mut e = Event {
        id: String::new(),
        pubkey: pubkey.to_string(),
        created_at: chrono::Utc::now().timestamp(),
        kind,
        tags,
        content: content.to_string(),
        sig: "b".repeat(128),
    };
    e.id = e.computed_id();
    e
}

async fn rehydrate(
    instance: &InstanceHandle,
    session_id: &str,
    host: &str,
    instance_name: &str,
) -> (SessionAttachment, mpsc::UnboundedSender<ServerFrame>, mpsc::UnboundedReceiver<ServerFrame>) {
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let attachment = SessionAttachment {
        session_id: session_id.to_string(),
        bookmark: None,
        host: host.to_string(),
        instance_name: instance_name.to_string(),
        has_paid: None,
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    instance
        .send_message(InstanceMessage::Rehydrate { attachment: attachment.clone(), outbox: outbox_tx.clone(), reply: reply_tx })
        .unwrap();
    reply_rx.await.unwrap();
    (attachment, outbox_tx, outbox_rx)
}

async fn send_frame(
    instance: &InstanceHandle,
    attachment: &SessionAttachment,
    outbox: &mpsc::UnboundedSender<ServerFrame>,
    frame: ClientFrame,
) {
    let (reply_tx, reply_rx) = oneshot::channel();
    instance
        .send_message(InstanceMessage::Frame {
            attachment: attachment.clone(),
            outbox: outbox.clone(),
            frame,
            reply: reply_tx,
        })
        .unwrap();
    reply_rx.await.unwrap();
}

fn test_config(overrides: impl FnOnce(&mut RelayConfig)) -> Arc<RelayConfig> {
    let mut config = RelayConfig::from_env();
    overrides(&mut config);
    Arc::new(config)
}

async fn spawn_test_instance(name: &str, config: Arc<RelayConfig>) -> InstanceHandle {
    let broadcast = Arc::new(BroadcastFabric::new(
        config.do_name.clone(),
        config.regional_endpoints.clone(),
        config.internal_broadcast_token.clone(),
        config.broadcast_timeout,
    ));
    let args = RelayInstanceArgs {
        config,
        event_store: Arc::new(MemoryEventStore::new()),
        state_store: Arc::new(MemoryInstanceStateStore::new()),
        payment_oracle: Arc::new(AlwaysUnpaidOracle),
        verifier: Arc::new(AlwaysValidVerifier),
        broadcast,
    };
    instance::spawn(name.to_string(), args).await.unwrap()
}

#[tokio::test]
async fn publish_then_subscribe_delivers_historical_match_and_eose() {
    let config = test_config(|_| {});
    let instance = spawn_test_instance("scenario-publish-subscribe", config).await;

    let (c1_attachment, c1_outbox, mut c1_rx) = rehydrate(&instance, "c1", "relay.example", "do-a").await;
    let event = signed_event(1, &"p".repeat(64), "hi", vec![]);
    send_frame(&instance, &c1_attachment, &c1_outbox, ClientFrame::Event(event.clone())).await;
    match c1_rx.try_recv().unwrap() {
        ServerFrame::Ok { accepted, .. } => assert!(accepted),
        other => panic!("expected OK, got {other:?}"),
    }

    let (c2_attachment, c2_outbox, mut c2_rx) = rehydrate(&instance, "c2", "relay.example", "do-a").await;
    let filter = Filter { authors: Some([event.pubkey.clone()].into_iter().collect()), kinds: Some([1u64].into_iter().collect()), ..Default::default() };
    send_frame(&instance, &c2_attachment, &c2_outbox, ClientFrame::Req { sub_id: "s".into(), filters: vec![filter] }).await;

    match c2_rx.try_recv().unwrap() {
        ServerFrame::Event { sub_id, event: delivered } => {
            assert_eq!(sub_id, "s");
            assert_eq!(delivered.id, event.id);
        }
        other => panic!("expected EVENT, got {other:?}"),
    }
    match c2_rx.try_recv().unwrap() {
        ServerFrame::Eose { sub_id } => assert_eq!(sub_id, "s"),
        other => panic!("expected EOSE, got {other:?}"),
    }

    instance.stop(None);
}

#[tokio::test]
async fn cross_region_publish_is_delivered_exactly_once() {
    let port_a = pick_port().await;
    let port_b = pick_port().await;
    let addr_a = format!("http://127.0.0.1:{port_a}");
    let addr_b = format!("http://127.0.0.1:{port_b}");
    let token = "shared-secret".to_string();

    let config_a = test_config(|c| {
        c.do_name = "region-a".into();
        c.regional_endpoints = vec![addr_b.clone()];
        c.internal_broadcast_token = token.clone();
    });
    let config_b = test_config(|c| {
        c.do_name = "region-b".into();
        c.regional_endpoints = vec![addr_a.clone()];
        c.internal_broadcast_token = token.clone();
    });

    let instance_a = spawn_test_instance("region-a-actor", config_a.clone()).await;
    let instance_b = spawn_test_instance("region-b-actor", config_b.clone()).await;

    serve_broadcast_endpoint(port_a, instance_a.clone(), config_a.clone());
    serve_broadcast_endpoint(port_b, instance_b.clone(), config_b.clone());
    wait_for_listener(port_a).await;
    wait_for_listener(port_b).await;

    let (_c1_attachment, _c1_outbox, _c1_rx) = rehydrate(&instance_a, "c1", "relay.example", "region-a").await;
    let (c2_attachment, c2_outbox, mut c2_rx) = rehydrate(&instance_b, "c2", "relay.example", "region-b").await;

    let filter = Filter { kinds: Some([7u64].into_iter().collect()), ..Default::default() };
    send_frame(&instance_b, &c2_attachment, &c2_outbox, ClientFrame::Req { sub_id: "s".into(), filters: vec![filter] }).await;
    match c2_rx.try_recv().unwrap() {
        ServerFrame::Eose { sub_id } => assert_eq!(sub_id, "s"),
        other => panic!("expected EOSE before the live publish, got {other:?}"),
    }

    let event = signed_event(7, &"q".repeat(64), "cross-region", vec![]);
    send_frame(&instance_a, &_c1_attachment, &_c1_outbox, ClientFrame::Event(event.clone())).await;

    let delivered = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(frame) = c2_rx.try_recv() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("expected the cross-region delivery within the broadcast timeout");

    match delivered {
        ServerFrame::Event { sub_id, event: received } => {
            assert_eq!(sub_id, "s");
            assert_eq!(received.id, event.id);
        }
        other => panic!("expected EVENT, got {other:?}"),
    }

    // Give any (incorrect) second delivery a chance to arrive before asserting exactly-once.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(c2_rx.try_recv().is_err(), "event should be delivered at most once");

    instance_a.stop(None);
    instance_b.stop(None);
}

#[tokio::test]
async fn auth_required_gates_subscribe_until_challenge_is_answered() {
    let config = test_config(|c| {
        c.auth_required = true;
    });
    let instance = spawn_test_instance("scenario-auth", config).await;

    let (attachment, outbox, mut rx) = rehydrate(&instance, "c1", "relay.example", "do-a").await;
    let challenge = match rx.try_recv().unwrap() {
        ServerFrame::Auth { challenge } => challenge,
        other => panic!("expected AUTH challenge immediately after connect, got {other:?}"),
    };

    send_frame(&instance, &attachment, &outbox, ClientFrame::Req { sub_id: "s".into(), filters: vec![Filter::default()] }).await;
    match rx.try_recv().unwrap() {
        ServerFrame::Closed { reason, .. } => assert_eq!(reason, "auth-required"),
        other => panic!("expected CLOSED auth-required, got {other:?}"),
    }

    let auth_event = {
        let mut e = Event {
            id: String::new(),
            pubkey: "a".repeat(64),
            created_at: chrono::Utc::now().timestamp(),
            kind: relaycore_server::config::AUTH_RESPONSE_KIND,
            tags: vec![
                vec!["challenge".to_string(), challenge.clone()],
                vec!["relay".to_string(), "relay.example".to_string()],
            ],
            content: String::new(),
            sig: "b".repeat(128),
        };
        e.id = e.computed_id();
        e
    };
    send_frame(&instance, &attachment, &outbox, ClientFrame::Auth(auth_event)).await;
    match rx.try_recv().unwrap() {
        ServerFrame::Ok { accepted, .. } => assert!(accepted),
        other => panic!("expected OK for the auth response, got {other:?}"),
    }

    send_frame(&instance, &attachment, &outbox, ClientFrame::Req { sub_id: "s".into(), filters: vec![Filter::default()] }).await;
    match rx.try_recv().unwrap() {
        ServerFrame::Eose { sub_id } => assert_eq!(sub_id, "s"),
        other => panic!("expected EOSE once authenticated, got {other:?}"),
    }

    instance.stop(None);
}

#[tokio::test]
async fn publish_rate_limit_rejects_the_third_event_in_a_burst() {
    let config = test_config(|c| {
        c.publish_rate_limit.capacity = 2;
        c.publish_rate_limit.refill_per_sec = 1.0;
    });
    let instance = spawn_test_instance("scenario-rate-limit", config).await;
    let (attachment, outbox, mut rx) = rehydrate(&instance, "c1", "relay.example", "do-a").await;

    for _ in 0..2 {
        let event = signed_event(1, &"r".repeat(64), "hi", vec![]);
        send_frame(&instance, &attachment, &outbox, ClientFrame::Event(event)).await;
        match rx.try_recv().unwrap() {
            ServerFrame::Ok { accepted, .. } => assert!(accepted),
            other => panic!("expected OK, got {other:?}"),
        }
    }

    let third = signed_event(1, &"r".repeat(64), "hi", vec![]);
    send_frame(&instance, &attachment, &outbox, ClientFrame::Event(third)).await;
    match rx.try_recv().unwrap() {
        ServerFrame::Ok { accepted, reason, .. } => {
            assert!(!accepted);
            assert_eq!(reason, "rate-limited");
        }
        other => panic!("expected rate-limited OK, got {other:?}"),
    }

    instance.stop(None);
}

#[tokio::test]
async fn subscription_survives_an_instance_restart() {
    let config = test_config(|_| {});
    let shared_state_store = Arc::new(MemoryInstanceStateStore::new());
    let shared_event_store = Arc::new(MemoryEventStore::new());

    let broadcast_v1 = Arc::new(BroadcastFabric::new(config.do_name.clone(), vec![], "tok".into(), config.broadcast_timeout));
    let instance_v1 = instance::spawn(
        "scenario-hibernation-v1".into(),
        RelayInstanceArgs {
            config: config.clone(),
            event_store: shared_event_store.clone(),
            state_store: shared_state_store.clone(),
            payment_oracle: Arc::new(AlwaysUnpaidOracle),
            verifier: Arc::new(AlwaysValidVerifier),
            broadcast: broadcast_v1,
        },
    )
    .await
    .unwrap();

    let (c_attachment, c_outbox, mut c_rx) = rehydrate(&instance_v1, "c1", "relay.example", "do-a").await;
    let filter = Filter { kinds: Some([1u64].into_iter().collect()), ..Default::default() };
    send_frame(&instance_v1, &c_attachment, &c_outbox, ClientFrame::Req { sub_id: "s".into(), filters: vec![filter] }).await;
    match c_rx.try_recv().unwrap() {
        ServerFrame::Eose { sub_id } => assert_eq!(sub_id, "s"),
        other => panic!("expected EOSE, got {other:?}"),
    }

    instance_v1.stop(None);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A fresh actor simulates the instance waking from hibernation: same
    // durable stores, empty in-memory state.
    let broadcast_v2 = Arc::new(BroadcastFabric::new(config.do_name.clone(), vec![], "tok".into(), config.broadcast_timeout));
    let instance_v2 = instance::spawn(
        "scenario-hibernation-v2".into(),
        RelayInstanceArgs {
            config: config.clone(),
            event_store: shared_event_store.clone(),
            state_store: shared_state_store.clone(),
            payment_oracle: Arc::new(AlwaysUnpaidOracle),
            verifier: Arc::new(AlwaysValidVerifier),
            broadcast: broadcast_v2,
        },
    )
    .await
    .unwrap();

    // Any inbound frame on the same attachment rehydrates the session and
    // its persisted subscriptions before this frame is dispatched.
    send_frame(&instance_v2, &c_attachment, &c_outbox, ClientFrame::Close { sub_id: "unrelated".into() }).await;
    match c_rx.try_recv().unwrap() {
        ServerFrame::Closed { sub_id, reason } => {
            assert_eq!(sub_id, "unrelated");
            assert_eq!(reason, "not found");
        }
        other => panic!("expected CLOSED not found for the wake-up frame, got {other:?}"),
    }

    let (publisher_attachment, publisher_outbox, _publisher_rx) =
        rehydrate(&instance_v2, "publisher", "relay.example", "do-a").await;
    let event = signed_event(1, &"w".repeat(64), "woke up", vec![]);
    send_frame(&instance_v2, &publisher_attachment, &publisher_outbox, ClientFrame::Event(event.clone())).await;

    match c_rx.try_recv().unwrap() {
        ServerFrame::Event { sub_id, event: delivered } => {
            assert_eq!(sub_id, "s");
            assert_eq!(delivered.id, event.id);
        }
        other => panic!("expected the post-restart publish to reach the rehydrated subscription, got {other:?}"),
    }

    instance_v2.stop(None);
}

#[derive(Clone, FromRef)]
struct BroadcastEndpointState {
    instance: InstanceHandle,
    config: Arc<RelayConfig>,
}

fn serve_broadcast_endpoint(port: u16, instance: InstanceHandle, config: Arc<RelayConfig>) {
    let state = BroadcastEndpointState { instance, config };
    let app = Router::new().route("/do-broadcast", post(broadcast_endpoint::broadcast)).with_state(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await.expect("bind broadcast endpoint");
        axum::serve(listener, app).await.ok();
    });
}

async fn pick_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_listener(port: u16) {
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("broadcast endpoint on port {port} never came up");
}
