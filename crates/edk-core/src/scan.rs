use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_ANGLE_DEG: i64 = 0;
pub const MAX_ANGLE_DEG: i64 = 180;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanRangeError {
    #[error("start angle {start} must be below end angle {end}")]
    Inverted { start: i64, end: i64 },
    #[error("angles must lie within {MIN_ANGLE_DEG}..={MAX_ANGLE_DEG}, got {start}..{end}")]
    OutOfBounds { start: i64, end: i64 },
}

/// Commanded sweep window. Constructing one through [`ScanRange::new`] is the
/// only way user input becomes a range, so the `start < end` invariant holds
/// everywhere a `ScanRange` exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanRange {
    start: u16,
    end: u16,
}

impl ScanRange {
    /// Validation policy: user-entered ranges are rejected, never adjusted.
    pub fn new(start: i64, end: i64) -> Result<Self, ScanRangeError> {
        if start >= end {
            return Err(ScanRangeError::Inverted { start, end });
        }
        if start < MIN_ANGLE_DEG || end > MAX_ANGLE_DEG {
            return Err(ScanRangeError::OutOfBounds { start, end });
        }
        Ok(Self {
            start: start as u16,
            end: end as u16,
        })
    }

    pub fn full() -> Self {
        Self { start: 0, end: 180 }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && u64::from(self.end) == MAX_ANGLE_DEG as u64
    }

    /// Wire text format the device expects on the command topic.
    pub fn encode(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }
}

impl Default for ScanRange {
    fn default() -> Self {
        Self::full()
    }
}

impl std::fmt::Display for ScanRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\u{b0}-{}\u{b0}", self.start, self.end)
    }
}

pub fn clamp_angle(angle: i64) -> u16 {
    angle.clamp(MIN_ANGLE_DEG, MAX_ANGLE_DEG) as u16
}

/// Clamping policy: commands derived programmatically (sweep presets, a held
/// single-angle measure) are clamped into bounds instead of rejected, and
/// `start == end` is permitted. Distinct from the [`ScanRange::new`] policy.
pub fn raw_command(start: i64, end: i64) -> String {
    format!("{}-{}", clamp_angle(start), clamp_angle(end))
}
