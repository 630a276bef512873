pub mod command;
pub mod dispatch;
pub mod pairing;
pub mod session;

pub use command::{ScanCommander, ScanDispatch};
pub use dispatch::{ReadingConsumer, ReadingDispatcher, HISTORY_CAPACITY};
pub use pairing::{PairingCoordinator, PairingError, PairingOutcome};
pub use session::{ChannelSession, ConnectionState, SessionConfig, SessionEvent};
