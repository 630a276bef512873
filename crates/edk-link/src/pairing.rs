use crate::session::{ChannelSession, ConnectionState, SessionEvent};
use chrono::Utc;
use edk_core::wire::{DeviceRegistration, DiscoverRequest};
use edk_core::Device;
use edk_storage::{DeviceStore, StorageError, UpsertOutcome};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

pub const DISCOVERY_DEADLINE: Duration = Duration::from_secs(15);
pub const CONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum PairingOutcome {
    Paired(Device),
    /// The deadline passed with no registration: a normal result, not an
    /// error.
    NoDeviceFound,
    /// The session never reached Connected within the grace period; no
    /// discovery message was published.
    ConnectionUnavailable,
    Canceled,
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("a pairing attempt is already discovering")]
    AlreadyDiscovering,
    #[error("device registry error: {0}")]
    Storage(#[from] StorageError),
}

/// Runs the bounded-time discovery handshake: publish a discovery request,
/// accept the first registration that answers, persist the device.
///
/// Correlation is deliberately "first message wins": the protocol carries no
/// request/response id, and a single responding device is assumed. Later
/// responders inside one window are ignored. Fragile if several units are
/// discoverable at once, but that is the documented behavior.
pub struct PairingCoordinator {
    session: Arc<ChannelSession>,
    store: Arc<StdMutex<DeviceStore>>,
    discovering: AtomicBool,
    generation: AtomicU64,
    cancel_tx: watch::Sender<u64>,
    deadline: Duration,
    connect_grace: Duration,
}

impl PairingCoordinator {
    pub fn new(session: Arc<ChannelSession>, store: Arc<StdMutex<DeviceStore>>) -> Self {
        let (cancel_tx, _) = watch::channel(0);
        Self {
            session,
            store,
            discovering: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            cancel_tx,
            deadline: DISCOVERY_DEADLINE,
            connect_grace: CONNECT_GRACE,
        }
    }

    /// Shorter windows for tests; production callers keep the defaults.
    pub fn with_timing(mut self, deadline: Duration, connect_grace: Duration) -> Self {
        self.deadline = deadline;
        self.connect_grace = connect_grace;
        self
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }

    /// Aborts the in-flight attempt, if any. A registration that arrives
    /// after this for the canceled generation resolves nothing.
    pub fn cancel(&self) {
        let current = self.generation.load(Ordering::SeqCst);
        self.cancel_tx.send_replace(current);
        debug!(event = "pairing_cancel_requested", generation = current);
    }

    pub async fn start_pairing(&self, user_id: &str) -> Result<PairingOutcome, PairingError> {
        if self.discovering.swap(true, Ordering::SeqCst) {
            return Err(PairingError::AlreadyDiscovering);
        }
        let outcome = self.run_attempt(user_id).await;
        self.discovering.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_attempt(&self, user_id: &str) -> Result<PairingOutcome, PairingError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Subscribe before any waiting; a cancel issued during the
        // connection grace must not be lost.
        let mut cancel_rx = self.cancel_tx.subscribe();

        tokio::select! {
            connected = self.await_connection() => {
                if !connected {
                    info!(event = "pairing_unavailable", user = user_id);
                    return Ok(PairingOutcome::ConnectionUnavailable);
                }
            }
            _ = Self::cancel_signal(&mut cancel_rx, generation) => {
                info!(event = "pairing_canceled", generation = generation);
                return Ok(PairingOutcome::Canceled);
            }
        }

        // Subscribe before publishing so a fast responder cannot slip
        // between the request and the listener.
        let mut events = self.session.events();

        if self.canceled(generation) {
            info!(event = "pairing_canceled", generation = generation);
            return Ok(PairingOutcome::Canceled);
        }

        let request = DiscoverRequest::new(user_id, Utc::now());
        if !self
            .session
            .publish_json(&self.session.topics().discover(), &request)
        {
            return Ok(PairingOutcome::ConnectionUnavailable);
        }
        info!(event = "pairing_started", user = user_id, generation = generation);

        let deadline = Instant::now() + self.deadline;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    info!(event = "pairing_timed_out", generation = generation);
                    return Ok(PairingOutcome::NoDeviceFound);
                }
                _ = Self::cancel_signal(&mut cancel_rx, generation) => {
                    info!(event = "pairing_canceled", generation = generation);
                    return Ok(PairingOutcome::Canceled);
                }
                event = events.recv() => {
                    match event {
                        Ok(SessionEvent::Message { topic, payload })
                            if topic == self.session.topics().register() =>
                        {
                            if self.canceled(generation) {
                                debug!(event = "registration_after_cancel", generation = generation);
                                return Ok(PairingOutcome::Canceled);
                            }
                            match serde_json::from_value::<DeviceRegistration>(payload) {
                                Ok(registration) => {
                                    return self.resolve(user_id, &registration).map(PairingOutcome::Paired);
                                }
                                Err(err) => {
                                    warn!(event = "registration_parse_error", error = %err);
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(event = "pairing_events_lagged", skipped = skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Ok(PairingOutcome::ConnectionUnavailable);
                        }
                    }
                }
            }
        }
    }

    fn resolve(
        &self,
        user_id: &str,
        registration: &DeviceRegistration,
    ) -> Result<Device, PairingError> {
        let device = Device::from_registration(registration, Utc::now());
        let outcome = self
            .store
            .lock()
            .expect("device store lock")
            .upsert_device(user_id, &device)?;
        match outcome {
            UpsertOutcome::Inserted => {
                info!(event = "device_paired", device_id = %device.id);
            }
            UpsertOutcome::Unchanged => {
                info!(event = "device_repaired", device_id = %device.id);
            }
        }
        Ok(device)
    }

    fn canceled(&self, generation: u64) -> bool {
        *self.cancel_tx.borrow() >= generation
    }

    /// Resolves only once a cancel at or past `generation` lands.
    async fn cancel_signal(cancel_rx: &mut watch::Receiver<u64>, generation: u64) {
        loop {
            if *cancel_rx.borrow() >= generation {
                return;
            }
            if cancel_rx.changed().await.is_err() {
                // The sender lives on the coordinator itself, so this arm
                // can never signal a cancel.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Bounded wait for the session to come up before giving up on the
    /// attempt entirely.
    async fn await_connection(&self) -> bool {
        if self.session.is_connected() {
            return true;
        }
        let mut state = self.session.watch_state();
        let wait = async {
            loop {
                if *state.borrow() == ConnectionState::Connected {
                    return;
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        };
        let _ = timeout(self.connect_grace, wait).await;
        self.session.is_connected()
    }
}
