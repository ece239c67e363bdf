//! Generic `SerialChannel` trait for byte-oriented links to a controller
//! (USB CDC boards, RS-232 adapters, …).

use std::time::Duration;

use kiosk_types::KioskError;
use serde::{Deserialize, Serialize};

/// A byte stream with bounded-wait reads.
///
/// Implementations must allow one thread to read while another writes; the
/// bridge reads from its reader thread and writes from the bus dispatcher.
/// Closing the link is the owner's job and happens by dropping the channel.
pub trait SerialChannel: Send + Sync {
    /// Stable identifier for this link, e.g. `"/dev/ttyUSB0"`.
    fn id(&self) -> &str;

    /// Read whatever bytes arrive within the channel's read timeout into
    /// `buf`.  Returns `Ok(0)` when the timeout elapses with nothing to read.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::SerialRead`] when the link is no longer usable.
    fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, KioskError>;

    /// Write `bytes` verbatim and flush them before returning.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::SerialWrite`] if the bytes could not be written.
    fn write_all(&self, bytes: &[u8]) -> Result<(), KioskError>;

    /// Upper bound on how long a single [`read_chunk`](Self::read_chunk)
    /// call may block.
    fn read_timeout(&self) -> Duration;
}

/// Where and how to open the controller's serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baud")]
    pub baud: u32,

    /// How long a read waits for data before returning empty.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud() -> u32 {
    9600
}
fn default_read_timeout_ms() -> u64 {
    200
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Reject settings that would make the link unusable.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<(), KioskError> {
        if self.port.trim().is_empty() {
            return Err(KioskError::Config("serial port must not be empty".into()));
        }
        if self.baud == 0 {
            return Err(KioskError::Config("baud rate must be non-zero".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(KioskError::Config(
                "serial read timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
