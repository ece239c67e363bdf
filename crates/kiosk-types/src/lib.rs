use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Delivery guarantee requested for a publish or subscription.
///
/// Mirrors the three MQTT quality-of-service levels so the bridge can state
/// its delivery needs without depending on a particular bus client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery; the receiver must tolerate duplicates.
    #[default]
    AtLeastOnce,
    /// Four-step handshake, delivered exactly once.
    ExactlyOnce,
}

/// A single message travelling over the pub/sub bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "kiosk/pickup/box_delivered"
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

impl BusMessage {
    /// Build a message stamped with a fresh id and the current time.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }

    /// Milliseconds since the message was created, used to log dispatch lag.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.timestamp).num_milliseconds()
    }

    /// The payload decoded as UTF-8, with invalid sequences replaced.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Observable state of the serial handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakeState {
    /// No command outstanding.
    Idle,
    /// Command written to the controller, waiting for its acknowledgment.
    Armed,
}

impl From<bool> for HandshakeState {
    fn from(armed: bool) -> Self {
        if armed { Self::Armed } else { Self::Idle }
    }
}

/// Error type shared by every crate in the kiosk workspace.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum KioskError {
    #[error("Serial open failed on {port}: {details}")]
    SerialOpen { port: String, details: String },

    /// The command could not be written; the handshake attempt is dropped.
    #[error("Serial write failed: {0}")]
    SerialWrite(String),

    /// The serial link can no longer be read; the reader loop terminates.
    #[error("Serial read failed: {0}")]
    SerialRead(String),

    #[error("Publish to '{topic}' timed out after {timeout_ms} ms")]
    PublishTimeout { topic: String, timeout_ms: u64 },

    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("Bus client error: {0}")]
    Bus(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

impl KioskError {
    /// Whether the error ends the reader loop rather than a single attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SerialRead(_) | Self::SerialOpen { .. })
    }
}
