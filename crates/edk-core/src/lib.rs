use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub mod scan;
pub mod wire;

pub use scan::{ScanRange, ScanRangeError, MAX_ANGLE_DEG, MIN_ANGLE_DEG};

/// One paired radar unit, as seen by the registry and the UI listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub kind: String,
    pub connection_status: DeviceStatus,
    pub last_seen_at: DateTime<Utc>,
    pub network_address: Option<String>,
    pub signal_quality: u8,
}

impl Device {
    /// Builds a device record from a registration response. Every field the
    /// device may omit falls back to a stable default so a sparse response
    /// still yields a usable record.
    pub fn from_registration(reg: &wire::DeviceRegistration, seen_at: DateTime<Utc>) -> Self {
        let id = reg
            .device_id
            .clone()
            .unwrap_or_else(|| "radar_001".to_string());
        let kind = reg.kind.clone().unwrap_or_else(|| "radar-servo".to_string());
        Self {
            display_name: display_name_for(&id),
            kind,
            connection_status: DeviceStatus::Connected,
            last_seen_at: seen_at,
            network_address: reg.ip.clone(),
            signal_quality: synthetic_signal_quality(&id),
            id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Connected,
    Disconnected,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Connected => "connected",
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "connected" | "online" => Ok(DeviceStatus::Connected),
            "disconnected" | "offline" => Ok(DeviceStatus::Disconnected),
            "unknown" => Ok(DeviceStatus::Unknown),
            other => Err(format!("Unknown device status: {other}")),
        }
    }
}

/// One angle/distance sample. A distance of zero or below means "no echo":
/// the sample is kept in history but is not plot-worthy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub angle_degrees: f64,
    pub distance: f64,
    pub observed_at: DateTime<Utc>,
    pub seq: u64,
}

impl Reading {
    pub fn has_echo(&self) -> bool {
        self.distance > 0.0
    }
}

/// Per-session client identity: user hint plus a random suffix so two tabs
/// for the same user never collide at the relay.
pub fn client_identity(user_hint: &str) -> String {
    let hint = if user_hint.trim().is_empty() {
        "anon"
    } else {
        user_hint.trim()
    };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("dash-{hint}-{}", &suffix[..8])
}

/// Display name derived from the reported id, e.g. "Radar-3f2a". The tail is
/// taken in characters, not bytes; ids are device-controlled input and may
/// carry multi-byte text.
pub fn display_name_for(device_id: &str) -> String {
    let skip = device_id.chars().count().saturating_sub(4);
    let tail: String = device_id.chars().skip(skip).collect();
    format!("Radar-{tail}")
}

/// Signal quality in 70..=99 derived from a hash of the device id. Used when
/// the device does not report one; deterministic so repeated pairings of the
/// same unit show the same figure.
pub fn synthetic_signal_quality(device_id: &str) -> u8 {
    let digest = Sha256::digest(device_id.as_bytes());
    70 + digest[0] % 30
}
