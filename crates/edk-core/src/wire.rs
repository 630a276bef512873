use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_CHANNEL: &str = "radar/1";

/// Routing keys for one device channel. The bare channel id carries live
/// readings; control and handshake traffic rides on suffixed topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    channel: String,
}

impl Topics {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn data(&self) -> String {
        self.channel.clone()
    }

    pub fn discover(&self) -> String {
        format!("{}/discover", self.channel)
    }

    pub fn register(&self) -> String {
        format!("{}/register", self.channel)
    }

    pub fn command(&self) -> String {
        format!("{}/setScan", self.channel)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.channel)
    }

    /// Topics the dashboard listens on. Outbound-only topics are absent.
    pub fn subscriptions(&self) -> [String; 3] {
        [self.data(), self.register(), self.status()]
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL)
    }
}

/// Frames exchanged with the relay itself. Application payloads are opaque
/// JSON values here; topic routing decides how they are parsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    Hello { client_id: String },
    Subscribe { topic: String },
    Publish { topic: String, payload: Value },
    Message { topic: String, payload: Value },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame(frame: &RelayFrame) -> Result<String, WireError> {
    serde_json::to_string(frame).map_err(|err| WireError::Encode(err.to_string()))
}

pub fn decode_frame(text: &str) -> Result<RelayFrame, WireError> {
    serde_json::from_str(text).map_err(|err| WireError::Decode(err.to_string()))
}

/// Discovery request published to `{channel}/discover`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoverRequest {
    pub action: String,
    pub user: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub client_type: String,
}

impl DiscoverRequest {
    pub fn new(user: &str, now: DateTime<Utc>) -> Self {
        Self {
            action: "discover".to_string(),
            user: user.to_string(),
            timestamp: now.timestamp_millis(),
            client_type: "dashboard".to_string(),
        }
    }
}

/// Registration response received on `{channel}/register`. Firmware in the
/// field omits fields freely, so everything is optional here and defaulted
/// when the device record is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRegistration {
    #[serde(default, rename = "deviceId")]
    pub device_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
}

/// Live sample received on the bare data topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataReading {
    pub angle: f64,
    pub distance: f64,
}

/// Liveness update received on `{channel}/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusUpdate {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub status: String,
}
