use edk_core::client_identity;
use edk_core::wire::{decode_frame, encode_frame, RelayFrame, Topics};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const RECONNECT_PERIOD: Duration = Duration::from_secs(2);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

const EVENT_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

/// The only way other components observe transport health: a typed event
/// stream instead of callback properties.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Errored(String),
    Message { topic: String, payload: Value },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub broker_url: Url,
    pub channel: String,
    pub connect_timeout: Duration,
    pub reconnect_period: Duration,
    pub keepalive_interval: Duration,
}

impl SessionConfig {
    pub fn new(broker_url: Url, channel: impl Into<String>) -> Self {
        Self {
            broker_url,
            channel: channel.into(),
            connect_timeout: CONNECT_TIMEOUT,
            reconnect_period: RECONNECT_PERIOD,
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }
}

enum PumpExit {
    Stopped,
    Dropped,
}

struct Wiring {
    outbound: mpsc::Sender<RelayFrame>,
    stop: watch::Sender<bool>,
}

/// One relay connection per logged-in session. Shared by the pairing
/// coordinator, the reading router and the scan commander; only one
/// connect/disconnect cycle runs at a time.
pub struct ChannelSession {
    config: SessionConfig,
    topics: Topics,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<SessionEvent>,
    wiring: StdMutex<Option<Wiring>>,
}

impl ChannelSession {
    pub fn new(config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let topics = Topics::new(config.channel.clone());
        Self {
            config,
            topics,
            state_tx,
            events_tx,
            wiring: StdMutex::new(None),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Opens the transport. No-op while a connection attempt is in flight or
    /// a connection is live; a fresh call after `Errored` is the
    /// caller-initiated retry path.
    pub fn connect(self: &Arc<Self>, identity_hint: &str) -> bool {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!(event = "connect_skipped", state = ?self.state());
                return false;
            }
            ConnectionState::Disconnected | ConnectionState::Errored => {}
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut wiring = self.wiring.lock().expect("wiring lock");
            *wiring = Some(Wiring {
                outbound: outbound_tx,
                stop: stop_tx,
            });
        }

        self.set_state(ConnectionState::Connecting);
        let client_id = client_identity(identity_hint);
        info!(event = "session_connecting", client_id = %client_id, url = %self.config.broker_url);

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run(client_id, outbound_rx, stop_rx).await;
        });
        true
    }

    /// Gracefully closes the transport. Idempotent.
    pub fn disconnect(&self) {
        let wiring = self.wiring.lock().expect("wiring lock").take();
        match wiring {
            Some(wiring) => {
                let _ = wiring.stop.send(true);
            }
            None => {
                // Nothing in flight; normalize a stale Errored state.
                if self.state() == ConnectionState::Errored {
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    /// Serializes a structured payload and sends it at most once. Returns
    /// false instead of erroring when the session is not connected.
    pub fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) -> bool {
        let value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "publish_encode_error", topic = topic, error = %err);
                return false;
            }
        };
        self.publish_value(topic, value)
    }

    /// Sends a raw text payload, used for the plain command format.
    pub fn publish_text(&self, topic: &str, text: &str) -> bool {
        self.publish_value(topic, Value::String(text.to_string()))
    }

    fn publish_value(&self, topic: &str, payload: Value) -> bool {
        if !self.is_connected() {
            warn!(event = "publish_skipped", topic = topic, "session not connected");
            return false;
        }
        let wiring = self.wiring.lock().expect("wiring lock");
        let Some(wiring) = wiring.as_ref() else {
            return false;
        };
        let frame = RelayFrame::Publish {
            topic: topic.to_string(),
            payload,
        };
        if wiring.outbound.try_send(frame).is_err() {
            warn!(event = "publish_backpressure", topic = topic);
            return false;
        }
        debug!(event = "published", topic = topic);
        true
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.events_tx.send(event);
    }

    async fn run(
        self: Arc<Self>,
        client_id: String,
        mut outbound_rx: mpsc::Receiver<RelayFrame>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        // Initial attempt: a failure here is terminal for this connect call,
        // retry is caller-initiated.
        let mut transport = match self.dial().await {
            Ok(transport) => transport,
            Err(reason) => {
                warn!(event = "session_connect_error", error = %reason);
                self.clear_wiring();
                self.set_state(ConnectionState::Errored);
                self.emit(SessionEvent::Errored(reason));
                return;
            }
        };

        loop {
            if let Err(err) = self.greet(&mut transport, &client_id).await {
                warn!(event = "session_greet_error", error = %err);
            } else {
                self.set_state(ConnectionState::Connected);
                self.emit(SessionEvent::Connected);
                info!(event = "session_connected", client_id = %client_id);

                let exit = self
                    .pump(&mut transport, &mut outbound_rx, &mut stop_rx)
                    .await;
                let _ = transport.close(None).await;
                self.set_state(ConnectionState::Disconnected);
                self.emit(SessionEvent::Disconnected);

                if matches!(exit, PumpExit::Stopped) {
                    self.clear_wiring();
                    info!(event = "session_closed");
                    return;
                }
            }

            // Transient loss after a successful connect: fixed backoff
            // reconnection, resubscribing from scratch each cycle.
            transport = loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            self.clear_wiring();
                            self.set_state(ConnectionState::Disconnected);
                            info!(event = "session_closed");
                            return;
                        }
                    }
                    _ = tokio::time::sleep(self.config.reconnect_period) => {
                        match self.dial().await {
                            Ok(transport) => break transport,
                            Err(reason) => {
                                debug!(event = "session_reconnect_error", error = %reason);
                            }
                        }
                    }
                }
            };
            info!(event = "session_reconnected");
        }
    }

    async fn dial(&self) -> Result<Transport, String> {
        match timeout(
            self.config.connect_timeout,
            connect_async(self.config.broker_url.clone()),
        )
        .await
        {
            Ok(Ok((transport, _response))) => Ok(transport),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            )),
        }
    }

    /// Identifies the session and registers topic interest. Runs on every
    /// connection cycle so resubscription stays idempotent.
    async fn greet(&self, transport: &mut Transport, client_id: &str) -> Result<(), String> {
        let mut frames = vec![RelayFrame::Hello {
            client_id: client_id.to_string(),
        }];
        for topic in self.topics.subscriptions() {
            frames.push(RelayFrame::Subscribe { topic });
        }
        for frame in frames {
            let text = encode_frame(&frame).map_err(|err| err.to_string())?;
            transport
                .send(Message::Text(text))
                .await
                .map_err(|err| err.to_string())?;
        }
        Ok(())
    }

    async fn pump(
        &self,
        transport: &mut Transport,
        outbound_rx: &mut mpsc::Receiver<RelayFrame>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return PumpExit::Stopped;
                    }
                }
                _ = keepalive.tick() => {
                    if transport.send(Message::Ping(Vec::new())).await.is_err() {
                        return PumpExit::Dropped;
                    }
                }
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else {
                        return PumpExit::Stopped;
                    };
                    let text = match encode_frame(&frame) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(event = "outbound_encode_error", error = %err);
                            continue;
                        }
                    };
                    if transport.send(Message::Text(text)).await.is_err() {
                        return PumpExit::Dropped;
                    }
                }
                inbound = transport.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.handle_inbound(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            if transport.send(Message::Pong(payload)).await.is_err() {
                                return PumpExit::Dropped;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return PumpExit::Dropped,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(event = "transport_error", error = %err);
                            return PumpExit::Dropped;
                        }
                    }
                }
            }
        }
    }

    fn handle_inbound(&self, text: &str) {
        match decode_frame(text) {
            Ok(RelayFrame::Message { topic, payload }) => {
                self.emit(SessionEvent::Message { topic, payload });
            }
            Ok(other) => {
                debug!(event = "unexpected_frame", frame = ?other);
            }
            Err(err) => {
                // Malformed inbound payload: drop this message only.
                warn!(event = "frame_decode_error", error = %err);
            }
        }
    }

    fn clear_wiring(&self) {
        self.wiring.lock().expect("wiring lock").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Arc<ChannelSession> {
        let url = Url::parse("ws://127.0.0.1:9").expect("url");
        Arc::new(ChannelSession::new(SessionConfig::new(url, "radar/1")))
    }

    #[test]
    fn publish_fails_without_a_connection() {
        let session = test_session();
        assert!(!session.publish_text("radar/1/setScan", "30-90"));
        assert!(!session.publish_json("radar/1/discover", &serde_json::json!({"a": 1})));
    }

    #[test]
    fn disconnect_is_idempotent_when_nothing_is_in_flight() {
        let session = test_session();
        session.disconnect();
        session.disconnect();
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn second_connect_while_connecting_is_a_no_op() {
        let session = test_session();
        assert!(session.connect("user-1"));
        assert!(!session.connect("user-1"));
        session.disconnect();
    }

    #[tokio::test]
    async fn failed_initial_connect_transitions_to_errored() {
        let session = test_session();
        let mut events = session.events();
        assert!(session.connect("user-1"));

        let event = tokio::time::timeout(Duration::from_secs(15), events.recv())
            .await
            .expect("event within connect timeout")
            .expect("event");
        assert!(matches!(event, SessionEvent::Errored(_)));
        assert_eq!(session.state(), ConnectionState::Errored);

        // Retry stays caller-initiated: connect is accepted again.
        assert!(session.connect("user-1"));
        session.disconnect();
    }
}
