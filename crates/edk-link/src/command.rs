use crate::session::ChannelSession;
use edk_core::scan::{self, ScanRange, ScanRangeError};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanDispatch {
    pub range: ScanRange,
    /// False when the session was not connected; the range still changed.
    pub sent: bool,
}

/// Validates scan-range changes and puts them on the command topic.
pub struct ScanCommander {
    session: Arc<ChannelSession>,
    current: StdMutex<ScanRange>,
}

impl ScanCommander {
    pub fn new(session: Arc<ChannelSession>) -> Self {
        Self {
            session,
            current: StdMutex::new(ScanRange::full()),
        }
    }

    pub fn current(&self) -> ScanRange {
        *self.current.lock().expect("scan range lock")
    }

    /// User-entered ranges: rejected when invalid, with no mutation and
    /// nothing on the wire.
    pub fn set_range(&self, start: i64, end: i64) -> Result<ScanDispatch, ScanRangeError> {
        let range = ScanRange::new(start, end)?;
        *self.current.lock().expect("scan range lock") = range;
        let sent = self
            .session
            .publish_text(&self.session.topics().command(), &range.encode());
        info!(event = "scan_range_set", range = %range, sent = sent);
        Ok(ScanDispatch { range, sent })
    }

    pub fn reset_to_full(&self) -> ScanDispatch {
        let range = ScanRange::full();
        *self.current.lock().expect("scan range lock") = range;
        let sent = self
            .session
            .publish_text(&self.session.topics().command(), &range.encode());
        info!(event = "scan_range_reset", sent = sent);
        ScanDispatch { range, sent }
    }

    /// Programmatic command path: clamped instead of rejected, and the
    /// commanded window is not recorded as the current range.
    pub fn send_raw(&self, start: i64, end: i64) -> bool {
        let command = scan::raw_command(start, end);
        self.session
            .publish_text(&self.session.topics().command(), &command)
    }

    /// Holds the sweep at a single angle for a point distance measure.
    pub fn hold_at(&self, angle: i64) -> bool {
        self.send_raw(angle, angle)
    }
}
