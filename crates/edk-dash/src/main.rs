mod ui;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use edk_core::wire::{DataReading, StatusUpdate, DEFAULT_CHANNEL};
use edk_core::DeviceStatus;
use edk_link::{
    ChannelSession, ConnectionState, PairingCoordinator, PairingOutcome, ReadingDispatcher,
    ScanCommander, SessionConfig, SessionEvent,
};
use edk_storage::DeviceStore;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use ui::{Notifier, Severity, TracingNotifier, Visualization};
use url::Url;

const DEFAULT_BROKER_URL: &str = "ws://127.0.0.1:9001/relay";
const DEFAULT_DB_PATH: &str = ".echodeck/registry.db";

/// Connection grace for one-shot commands; a touch over the session's own
/// dial timeout so we report its failure rather than race it.
const LINK_WAIT: Duration = Duration::from_secs(12);

#[derive(Parser)]
#[command(name = "edk-dash")]
#[command(about = "Echodeck radar dashboard", long_about = None)]
struct Cli {
    /// Broker websocket url (env: EDK_BROKER_URL)
    #[arg(long, global = true, default_value = "")]
    broker: String,
    /// Channel the radar publishes on (env: EDK_CHANNEL)
    #[arg(long, global = true, default_value = "")]
    channel: String,
    /// Registry database path (env: EDK_DB)
    #[arg(long, global = true, default_value = "")]
    db: String,
    /// User the registry is scoped to (env: EDK_USER)
    #[arg(long, global = true, default_value = "")]
    user: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the logged-in user
    Login {
        user: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Clear the logged-in user
    Logout,
    /// Discover a radar unit and add it to the registry
    Pair,
    /// Manage the device registry
    Devices {
        #[command(subcommand)]
        action: DeviceCommands,
    },
    /// Scan window commands
    Scan {
        #[command(subcommand)]
        action: ScanCommands,
    },
    /// Run the live dashboard loop until interrupted
    Run {
        /// Device to stream from; defaults to the first registered one
        #[arg(long)]
        device: Option<String>,
    },
}

#[derive(Subcommand)]
enum DeviceCommands {
    List,
    Remove { id: String },
}

#[derive(Subcommand)]
enum ScanCommands {
    /// Set the sweep window, rejecting invalid ranges
    Set { start: i64, end: i64 },
    /// Return to the full 0-180 sweep
    Reset,
    /// Park the sweep at a single angle
    Hold { angle: i64 },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let db_path = resolve_db(&cli.db);
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let store = Arc::new(StdMutex::new(
        DeviceStore::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?,
    ));

    match cli.command {
        Commands::Login { user, name } => {
            store
                .lock()
                .expect("store lock")
                .set_active_user(&user, name.as_deref())?;
            println!("logged in as {user}");
            Ok(())
        }
        Commands::Logout => {
            let cleared = store.lock().expect("store lock").clear_active_user()?;
            if cleared {
                println!("logged out");
            } else {
                println!("no user was logged in");
            }
            Ok(())
        }
        Commands::Devices { action } => {
            let user = resolve_user(&cli.user, &store)?;
            match action {
                DeviceCommands::List => {
                    let devices = store.lock().expect("store lock").list_devices(&user)?;
                    if devices.is_empty() {
                        println!("no devices registered for {user}");
                        return Ok(());
                    }
                    for device in devices {
                        println!(
                            "{}  {}  {}  signal {}%  {}",
                            device.id,
                            device.display_name,
                            device.connection_status,
                            device.signal_quality,
                            device.network_address.as_deref().unwrap_or("-"),
                        );
                    }
                    Ok(())
                }
                DeviceCommands::Remove { id } => {
                    let removed = store.lock().expect("store lock").remove_device(&user, &id)?;
                    if removed {
                        println!("removed {id}");
                    } else {
                        println!("no device {id} for {user}");
                    }
                    Ok(())
                }
            }
        }
        Commands::Pair => {
            let user = resolve_user(&cli.user, &store)?;
            let session = build_session(&cli)?;
            session.connect(&user);
            let coordinator = PairingCoordinator::new(session.clone(), store.clone());

            let notifier = TracingNotifier;
            notifier.notify(Severity::Info, "searching for a radar unit...");
            let outcome = coordinator.start_pairing(&user).await?;
            session.disconnect();

            match outcome {
                PairingOutcome::Paired(device) => {
                    notifier.notify(
                        Severity::Success,
                        &format!("paired with {} ({})", device.display_name, device.id),
                    );
                    Ok(())
                }
                PairingOutcome::NoDeviceFound => {
                    notifier.notify(Severity::Warning, "no device answered in time");
                    Ok(())
                }
                PairingOutcome::ConnectionUnavailable => {
                    bail!("broker unreachable; check --broker / EDK_BROKER_URL")
                }
                PairingOutcome::Canceled => {
                    notifier.notify(Severity::Info, "pairing canceled");
                    Ok(())
                }
            }
        }
        Commands::Scan { ref action } => {
            let session = build_session(&cli)?;
            session.connect("scan");
            if !wait_for_link(&session).await {
                session.disconnect();
                bail!("broker unreachable; check --broker / EDK_BROKER_URL");
            }

            let commander = ScanCommander::new(session.clone());
            let result = match action {
                ScanCommands::Set { start, end } => match commander.set_range(*start, *end) {
                    Ok(dispatch) => {
                        println!("scan window set to {}", dispatch.range);
                        Ok(())
                    }
                    Err(err) => bail!("rejected: {err}"),
                },
                ScanCommands::Reset => {
                    let dispatch = commander.reset_to_full();
                    println!("scan window reset to {}", dispatch.range);
                    Ok(())
                }
                ScanCommands::Hold { angle } => {
                    if commander.hold_at(*angle) {
                        println!("holding at {angle}\u{b0}");
                        Ok(())
                    } else {
                        bail!("command not sent; link dropped")
                    }
                }
            };
            // Let the writer task drain before tearing the socket down.
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.disconnect();
            result
        }
        Commands::Run { ref device } => {
            let user = resolve_user(&cli.user, &store)?;
            let session = build_session(&cli)?;
            session.connect(&user);
            run_dashboard(session, store, &user, device.clone()).await
        }
    }
}

async fn run_dashboard(
    session: Arc<ChannelSession>,
    store: Arc<StdMutex<DeviceStore>>,
    user: &str,
    device_flag: Option<String>,
) -> Result<()> {
    let notifier = TracingNotifier;

    let active_device = match device_flag {
        Some(id) => Some(id),
        None => store
            .lock()
            .expect("store lock")
            .list_devices(user)?
            .first()
            .map(|device| device.id.clone()),
    };
    match &active_device {
        Some(id) => info!(event = "dashboard_started", device = %id),
        None => notifier.notify(
            Severity::Warning,
            "no device registered; readings will be dropped until one is paired",
        ),
    }

    let mut dispatcher = ReadingDispatcher::new();
    dispatcher.set_active_device(active_device);
    dispatcher.subscribe(Box::new(ui::LogConsumer));
    // The surface handle stays with the loop so a link drop can wipe stale
    // echoes off the display.
    let plot = Rc::new(RefCell::new(ui::ConsolePlot));
    dispatcher.subscribe(Box::new(ui::PlotConsumer::new(plot.clone())));

    let topics = session.topics().clone();
    let mut events = session.events();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(event = "dashboard_stopping");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Message { topic, payload }) => {
                    if topic == topics.data() {
                        match serde_json::from_value::<DataReading>(payload) {
                            Ok(sample) => {
                                dispatcher.ingest(sample.angle, sample.distance);
                            }
                            Err(err) => warn!(event = "reading_parse_error", error = %err),
                        }
                    } else if topic == topics.status() {
                        match serde_json::from_value::<StatusUpdate>(payload) {
                            Ok(update) => {
                                let status = update
                                    .status
                                    .parse::<DeviceStatus>()
                                    .unwrap_or(DeviceStatus::Unknown);
                                let known = store
                                    .lock()
                                    .expect("store lock")
                                    .update_status(user, &update.device_id, status, Utc::now())?;
                                if !known {
                                    debug!(event = "status_for_unknown_device", device = %update.device_id);
                                }
                            }
                            Err(err) => warn!(event = "status_parse_error", error = %err),
                        }
                    } else if topic == topics.register() {
                        // Registrations outside a pairing window carry no
                        // request context; log and move on.
                        debug!(event = "unsolicited_registration", topic = %topic);
                    } else {
                        debug!(event = "unrouted_message", topic = %topic);
                    }
                }
                Ok(SessionEvent::Connected) => {
                    notifier.notify(Severity::Success, "broker link up");
                }
                Ok(SessionEvent::Disconnected) => {
                    plot.borrow_mut().clear();
                    notifier.notify(Severity::Warning, "broker link lost; retrying");
                }
                Ok(SessionEvent::Errored(reason)) => {
                    notifier.notify(Severity::Error, &format!("broker connection failed: {reason}"));
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event = "dashboard_events_lagged", skipped = skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    session.disconnect();
    Ok(())
}

fn build_session(cli: &Cli) -> Result<Arc<ChannelSession>> {
    let broker = resolve_broker(&cli.broker)?;
    let channel = resolve_channel(&cli.channel);
    Ok(Arc::new(ChannelSession::new(SessionConfig::new(
        broker, channel,
    ))))
}

async fn wait_for_link(session: &Arc<ChannelSession>) -> bool {
    if session.is_connected() {
        return true;
    }
    let mut state = session.watch_state();
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
    let _ = tokio::time::timeout(LINK_WAIT, wait).await;
    session.is_connected()
}

fn init_logging() {
    let level = std::env::var("EDK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn resolve_broker(flag: &str) -> Result<Url> {
    let raw = first_of(flag, "EDK_BROKER_URL").unwrap_or_else(|| DEFAULT_BROKER_URL.to_string());
    Url::parse(&raw).with_context(|| format!("invalid broker url: {raw}"))
}

fn resolve_channel(flag: &str) -> String {
    first_of(flag, "EDK_CHANNEL").unwrap_or_else(|| DEFAULT_CHANNEL.to_string())
}

fn resolve_db(flag: &str) -> PathBuf {
    PathBuf::from(first_of(flag, "EDK_DB").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()))
}

fn resolve_user(flag: &str, store: &Arc<StdMutex<DeviceStore>>) -> Result<String> {
    if let Some(user) = first_of(flag, "EDK_USER") {
        return Ok(user);
    }
    if let Some(active) = store.lock().expect("store lock").active_user()? {
        return Ok(active.user_id);
    }
    bail!("no user logged in; run `edk-dash login <user>` or pass --user")
}

fn first_of(flag: &str, env_key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return Some(value);
        }
    }
    None
}
