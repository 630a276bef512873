use edk_core::wire::{decode_frame, encode_frame, RelayFrame};
use edk_link::{
    ChannelSession, PairingCoordinator, PairingError, PairingOutcome, SessionConfig, SessionEvent,
};
use edk_storage::DeviceStore;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

struct RelayHarness {
    url: Url,
    seen: mpsc::Receiver<RelayFrame>,
    inject: mpsc::Sender<RelayFrame>,
}

/// Minimal in-process relay: records every frame the session sends and
/// forwards injected frames back down the socket. Accepts connections
/// serially so reconnect cycles keep working.
async fn spawn_relay() -> RelayHarness {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (seen_tx, seen_rx) = mpsc::channel(64);
    let (inject_tx, mut inject_rx) = mpsc::channel::<RelayFrame>(64);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let mut ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(_) => continue,
            };
            loop {
                tokio::select! {
                    inbound = ws.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(frame) = decode_frame(&text) {
                                if seen_tx.send(frame).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                    frame = inject_rx.recv() => match frame {
                        Some(frame) => {
                            let text = encode_frame(&frame).expect("encode");
                            if ws.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => return,
                    },
                }
            }
        }
    });

    RelayHarness {
        url: Url::parse(&format!("ws://{addr}")).expect("url"),
        seen: seen_rx,
        inject: inject_tx,
    }
}

fn session_for(harness: &RelayHarness) -> Arc<ChannelSession> {
    Arc::new(ChannelSession::new(SessionConfig::new(
        harness.url.clone(),
        "radar/1",
    )))
}

fn shared_store() -> Arc<StdMutex<DeviceStore>> {
    Arc::new(StdMutex::new(
        DeviceStore::open_in_memory().expect("open store"),
    ))
}

async fn next_frame(seen: &mut mpsc::Receiver<RelayFrame>) -> RelayFrame {
    tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .expect("frame within deadline")
        .expect("relay alive")
}

async fn await_connected(events: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within deadline")
            .expect("events open");
        if matches!(event, SessionEvent::Connected) {
            return;
        }
    }
}

#[tokio::test]
async fn session_greets_and_subscribes_on_connect() {
    let mut harness = spawn_relay().await;
    let session = session_for(&harness);
    let mut events = session.events();

    assert!(session.connect("user-1"));
    await_connected(&mut events).await;

    match next_frame(&mut harness.seen).await {
        RelayFrame::Hello { client_id } => assert!(client_id.starts_with("dash-user-1-")),
        other => panic!("expected hello first, got {other:?}"),
    }

    let mut topics = Vec::new();
    for _ in 0..3 {
        match next_frame(&mut harness.seen).await {
            RelayFrame::Subscribe { topic } => topics.push(topic),
            other => panic!("expected subscribe, got {other:?}"),
        }
    }
    topics.sort();
    assert_eq!(
        topics,
        vec!["radar/1", "radar/1/register", "radar/1/status"]
    );

    session.disconnect();
}

#[tokio::test]
async fn published_frames_reach_the_relay() {
    let mut harness = spawn_relay().await;
    let session = session_for(&harness);
    let mut events = session.events();
    session.connect("user-1");
    await_connected(&mut events).await;

    assert!(session.publish_text("radar/1/setScan", "30-90"));

    loop {
        match next_frame(&mut harness.seen).await {
            RelayFrame::Publish { topic, payload } => {
                assert_eq!(topic, "radar/1/setScan");
                assert_eq!(payload, json!("30-90"));
                break;
            }
            _ => continue,
        }
    }

    session.disconnect();
}

#[tokio::test]
async fn inbound_messages_fan_out_as_events() {
    let harness = spawn_relay().await;
    let session = session_for(&harness);
    let mut events = session.events();
    session.connect("user-1");
    await_connected(&mut events).await;

    harness
        .inject
        .send(RelayFrame::Message {
            topic: "radar/1".to_string(),
            payload: json!({"angle": 45, "distance": 100.5}),
        })
        .await
        .expect("inject");

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within deadline")
            .expect("events open");
        if let SessionEvent::Message { topic, payload } = event {
            assert_eq!(topic, "radar/1");
            assert_eq!(payload["angle"], json!(45));
            break;
        }
    }

    session.disconnect();
}

#[tokio::test]
async fn pairing_resolves_on_first_registration() {
    let mut harness = spawn_relay().await;
    let session = session_for(&harness);
    let store = shared_store();
    let coordinator = PairingCoordinator::new(session.clone(), store.clone())
        .with_timing(Duration::from_secs(5), Duration::from_secs(2));

    let mut events = session.events();
    session.connect("user-1");
    await_connected(&mut events).await;

    let inject = harness.inject.clone();
    let responder = tokio::spawn(async move {
        loop {
            if let RelayFrame::Publish { topic, .. } = next_frame(&mut harness.seen).await {
                if topic == "radar/1/discover" {
                    inject
                        .send(RelayFrame::Message {
                            topic: "radar/1/register".to_string(),
                            payload: json!({
                                "deviceId": "radar_88ab",
                                "type": "radar-servo",
                                "ip": "10.0.0.7",
                            }),
                        })
                        .await
                        .expect("inject registration");
                    return;
                }
            }
        }
    });

    let outcome = coordinator.start_pairing("user-1").await.expect("pairing");
    responder.await.expect("responder");

    match outcome {
        PairingOutcome::Paired(device) => {
            assert_eq!(device.id, "radar_88ab");
            assert_eq!(device.display_name, "Radar-88ab");
            assert_eq!(device.network_address.as_deref(), Some("10.0.0.7"));
        }
        other => panic!("expected paired, got {other:?}"),
    }

    let devices = store
        .lock()
        .expect("store lock")
        .list_devices("user-1")
        .expect("list");
    assert_eq!(devices.len(), 1);

    session.disconnect();
}

#[tokio::test]
async fn second_attempt_is_rejected_without_canceling_the_first() {
    let harness = spawn_relay().await;
    let session = session_for(&harness);
    let store = shared_store();
    let coordinator = Arc::new(
        PairingCoordinator::new(session.clone(), store.clone())
            .with_timing(Duration::from_millis(700), Duration::from_secs(2)),
    );

    let mut events = session.events();
    session.connect("user-1");
    await_connected(&mut events).await;

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.start_pairing("user-1").await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(coordinator.is_discovering());

    let second = coordinator.start_pairing("user-1").await;
    assert!(matches!(second, Err(PairingError::AlreadyDiscovering)));

    // The first attempt keeps running to its own deadline.
    let outcome = first.await.expect("join").expect("pairing");
    assert_eq!(outcome, PairingOutcome::NoDeviceFound);
    assert!(!coordinator.is_discovering());

    session.disconnect();
}

#[tokio::test]
async fn late_registration_after_timeout_resolves_nothing() {
    let harness = spawn_relay().await;
    let session = session_for(&harness);
    let store = shared_store();
    let coordinator = PairingCoordinator::new(session.clone(), store.clone())
        .with_timing(Duration::from_millis(300), Duration::from_secs(2));

    let mut events = session.events();
    session.connect("user-1");
    await_connected(&mut events).await;

    let outcome = coordinator.start_pairing("user-1").await.expect("pairing");
    assert_eq!(outcome, PairingOutcome::NoDeviceFound);

    harness
        .inject
        .send(RelayFrame::Message {
            topic: "radar/1/register".to_string(),
            payload: json!({"deviceId": "radar_late"}),
        })
        .await
        .expect("inject");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(store
        .lock()
        .expect("store lock")
        .list_devices("user-1")
        .expect("list")
        .is_empty());

    session.disconnect();
}

#[tokio::test]
async fn canceled_attempt_ignores_a_later_registration() {
    let harness = spawn_relay().await;
    let session = session_for(&harness);
    let store = shared_store();
    let coordinator = Arc::new(
        PairingCoordinator::new(session.clone(), store.clone())
            .with_timing(Duration::from_secs(10), Duration::from_secs(2)),
    );

    let mut events = session.events();
    session.connect("user-1");
    await_connected(&mut events).await;

    let attempt = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.start_pairing("user-1").await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    coordinator.cancel();

    let outcome = attempt.await.expect("join").expect("pairing");
    assert_eq!(outcome, PairingOutcome::Canceled);

    harness
        .inject
        .send(RelayFrame::Message {
            topic: "radar/1/register".to_string(),
            payload: json!({"deviceId": "radar_after_cancel"}),
        })
        .await
        .expect("inject");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(store
        .lock()
        .expect("store lock")
        .list_devices("user-1")
        .expect("list")
        .is_empty());

    session.disconnect();
}

#[tokio::test]
async fn cancel_during_the_connection_grace_resolves_promptly() {
    // The session never connects, so the attempt sits in its grace wait
    // when the cancel lands.
    let url = Url::parse("ws://127.0.0.1:9").expect("url");
    let session = Arc::new(ChannelSession::new(SessionConfig::new(url, "radar/1")));
    let store = shared_store();
    let coordinator = Arc::new(
        PairingCoordinator::new(session, store)
            .with_timing(Duration::from_secs(10), Duration::from_secs(3)),
    );

    let attempt = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.start_pairing("user-1").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    coordinator.cancel();

    let outcome = tokio::time::timeout(Duration::from_millis(500), attempt)
        .await
        .expect("resolved well before the grace expired")
        .expect("join")
        .expect("pairing");
    assert_eq!(outcome, PairingOutcome::Canceled);
    assert!(!coordinator.is_discovering());
}

#[tokio::test]
async fn pairing_without_a_connection_publishes_nothing() {
    // No relay at all: the session stays disconnected.
    let url = Url::parse("ws://127.0.0.1:9").expect("url");
    let session = Arc::new(ChannelSession::new(SessionConfig::new(url, "radar/1")));
    let store = shared_store();
    let coordinator = PairingCoordinator::new(session, store.clone())
        .with_timing(Duration::from_secs(5), Duration::from_millis(200));

    let started = std::time::Instant::now();
    let outcome = coordinator.start_pairing("user-1").await.expect("pairing");
    assert_eq!(outcome, PairingOutcome::ConnectionUnavailable);
    assert!(started.elapsed() < Duration::from_secs(2), "grace period only");

    assert!(store
        .lock()
        .expect("store lock")
        .list_devices("user-1")
        .expect("list")
        .is_empty());
}
