//! Bus-to-serial handshake bridge.
//!
//! This module provides [`HandshakeBridge`], which:
//!
//! 1. **Arms** on every ready event delivered on its subscribed topic: the
//!    fixed command bytes are written and flushed to the controller, then the
//!    shared `armed` flag is raised.
//!
//! 2. **Listens** on a dedicated reader thread for the controller's
//!    acknowledgment token.  When the token shows up while armed, the flag is
//!    lowered and a completion message is published (QoS 1).
//!
//! ```text
//!            ready event                      write "o\n"
//!   bus ─────────────────▶ on_ready_event ─────────────────▶ controller
//!    ▲                            │ armed = true                  │
//!    │                            ▼                               │ "done"
//!    └──── publish "success" ◀── reader loop ◀───────────────────┘
//!                                 armed = false
//! ```
//!
//! The `armed` flag is the only state shared between the bus dispatcher and
//! the reader thread.  A second ready event before the acknowledgment simply
//! re-sends the command; one acknowledgment then completes both.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use kiosk_hal::SerialChannel;
use kiosk_types::{BusMessage, HandshakeState, KioskError, QoS};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::ack::AckMatcher;
use crate::bus::topic_matches;
use crate::client::{BusClient, BusHandler};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Topics, bytes and timings the bridge is built with.  Fixed for the
/// lifetime of a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Topic whose messages arm the bridge.
    #[serde(default = "default_ready_topic")]
    pub ready_topic: String,

    /// Topic the completion message is published to.
    #[serde(default = "default_completion_topic")]
    pub completion_topic: String,

    #[serde(default = "default_completion_payload")]
    pub completion_payload: String,

    /// Bytes written to the controller on every arming.
    #[serde(default = "default_command")]
    pub command: String,

    /// Case-insensitive acknowledgment token.
    #[serde(default = "default_ack_token")]
    pub ack_token: String,

    /// Upper bound on handing the completion message to the bus.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Recognise a token split across two consecutive reads.
    #[serde(default = "default_ack_across_reads")]
    pub ack_across_reads: bool,

    /// Buffer size for each serial read.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_ready_topic() -> String {
    "kiosk/pickup/box_delivered".to_string()
}
fn default_completion_topic() -> String {
    "kiosk/pickup/all_done".to_string()
}
fn default_completion_payload() -> String {
    "success".to_string()
}
fn default_command() -> String {
    "o\n".to_string()
}
fn default_ack_token() -> String {
    "done".to_string()
}
fn default_publish_timeout_ms() -> u64 {
    5_000
}
fn default_ack_across_reads() -> bool {
    true
}
fn default_chunk_size() -> usize {
    64
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ready_topic: default_ready_topic(),
            completion_topic: default_completion_topic(),
            completion_payload: default_completion_payload(),
            command: default_command(),
            ack_token: default_ack_token(),
            publish_timeout_ms: default_publish_timeout_ms(),
            ack_across_reads: default_ack_across_reads(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl BridgeConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// # Errors
    ///
    /// Returns [`KioskError::Config`] naming the first unusable field.
    pub fn validate(&self) -> Result<(), KioskError> {
        let non_empty = [
            ("ready_topic", &self.ready_topic),
            ("completion_topic", &self.completion_topic),
            ("command", &self.command),
            ("ack_token", &self.ack_token),
        ];
        for (field, value) in non_empty {
            if value.is_empty() {
                return Err(KioskError::Config(format!("{field} must not be empty")));
            }
        }
        if self.completion_topic.contains(['+', '#']) {
            return Err(KioskError::Config(
                "completion_topic must not contain wildcards".into(),
            ));
        }
        if self.publish_timeout_ms == 0 {
            return Err(KioskError::Config("publish_timeout_ms must be non-zero".into()));
        }
        if self.chunk_size == 0 {
            return Err(KioskError::Config("chunk_size must be non-zero".into()));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bridge
// ────────────────────────────────────────────────────────────────────────────

/// Coordinates the ready → command → acknowledgment → completion handshake.
///
/// Clone it cheaply – all clones share the same flag, serial channel and bus.
#[derive(Clone)]
pub struct HandshakeBridge {
    config: Arc<BridgeConfig>,
    serial: Arc<dyn SerialChannel>,
    bus: Arc<dyn BusClient>,
    armed: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl HandshakeBridge {
    /// Create a bridge over an already-open serial channel and a bus client.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Config`] if `config` does not validate.
    pub fn new(
        config: BridgeConfig,
        serial: Arc<dyn SerialChannel>,
        bus: Arc<dyn BusClient>,
    ) -> Result<Self, KioskError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            serial,
            bus,
            armed: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> HandshakeState {
        HandshakeState::from(self.armed.load(Ordering::SeqCst))
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Idle → Armed
    // -----------------------------------------------------------------------

    /// Handle a message delivered on the bus.
    ///
    /// Messages on other topics are ignored.  On the ready topic the command
    /// is written and flushed, then the bridge is armed.  This performs
    /// blocking serial I/O; async callers should run it on a blocking task.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::SerialWrite`] when the command could not be
    /// written.  The attempt is dropped and the flag is left untouched, so the
    /// next ready event is processed normally.
    #[instrument(skip(self, payload), fields(payload = %String::from_utf8_lossy(payload)))]
    pub fn on_ready_event(&self, topic: &str, payload: &[u8]) -> Result<(), KioskError> {
        if !topic_matches(&self.config.ready_topic, topic) {
            debug!("ignoring message on unrelated topic");
            return Ok(());
        }

        if let Err(e) = self.serial.write_all(self.config.command.as_bytes()) {
            error!(error = %e, port = self.serial.id(), "serial write failed; dropping ready event");
            return Err(e);
        }

        let was_armed = self.armed.swap(true, Ordering::SeqCst);
        if was_armed {
            info!(command = ?self.config.command, "command re-sent while already armed");
        } else {
            info!(command = ?self.config.command, "command sent; waiting for acknowledgment");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Armed → Idle
    // -----------------------------------------------------------------------

    /// Disarm, then publish the completion message.
    ///
    /// The flag is lowered before the publish starts, so a ready event that
    /// arrives while the publish is in flight arms a fresh cycle instead of
    /// being wiped out.  A failed publish does not re-arm: the acknowledgment
    /// has already been consumed from the controller.  When the bridge is not
    /// armed nothing is published.
    ///
    /// # Errors
    ///
    /// [`KioskError::PublishTimeout`] when the bus does not accept the message
    /// within the configured timeout, or the bus client's own error.
    #[instrument(skip(self), fields(topic = %self.config.completion_topic))]
    pub async fn complete_handshake(&self) -> Result<(), KioskError> {
        if self
            .armed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("not armed; nothing to complete");
            return Ok(());
        }

        let timeout = self.config.publish_timeout();
        let publish = self.bus.publish(
            &self.config.completion_topic,
            self.config.completion_payload.clone().into_bytes(),
            QoS::AtLeastOnce,
        );
        let result = match tokio::time::timeout(timeout, publish).await {
            Ok(res) => res,
            Err(_) => Err(KioskError::PublishTimeout {
                topic: self.config.completion_topic.clone(),
                timeout_ms: self.config.publish_timeout_ms,
            }),
        };

        match &result {
            Ok(()) => info!(payload = %self.config.completion_payload, "completion published"),
            Err(e) => error!(error = %e, "completion publish failed; handshake already consumed"),
        }
        result
    }

    // -----------------------------------------------------------------------
    // Reader thread
    // -----------------------------------------------------------------------

    /// Spawn the reader loop on its own thread.
    ///
    /// `runtime` drives the completion publish; it must outlive the thread.
    /// A [`stop`](Self::stop) issued earlier is honoured: the new reader exits
    /// before its first read.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Channel`] if the OS refuses to spawn the thread.
    pub fn start(&self, runtime: Handle) -> Result<ReaderHandle, KioskError> {
        let bridge = self.clone();
        let thread = std::thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || bridge.reader_loop(&runtime))
            .map_err(|e| KioskError::Channel(format!("failed to spawn serial reader: {e}")))?;
        Ok(ReaderHandle {
            stop: Arc::clone(&self.stop),
            thread,
        })
    }

    /// Ask the reader loop to exit at its next read-timeout boundary.
    ///
    /// The serial channel is left open; close it only after the reader has
    /// been joined.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            info!("serial reader stop requested");
        }
    }

    /// Read the serial channel until stopped or the link fails.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::SerialRead`] when a read fails; the loop does not
    /// restart itself.
    pub fn reader_loop(&self, runtime: &Handle) -> Result<(), KioskError> {
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut matcher = AckMatcher::new(&self.config.ack_token, self.config.ack_across_reads);

        info!(
            port = self.serial.id(),
            token = %self.config.ack_token,
            "serial reader started"
        );

        while !self.stop.load(Ordering::SeqCst) {
            let n = match self.serial.read_chunk(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, port = self.serial.id(), "serial reader terminated");
                    return Err(e);
                }
            };
            if n == 0 {
                continue;
            }

            let chunk = &buf[..n];
            if !self.armed.load(Ordering::SeqCst) {
                matcher.reset();
                trace!(chunk = %String::from_utf8_lossy(chunk), "discarding chunk while idle");
                continue;
            }

            if matcher.feed(chunk) {
                info!(chunk = %String::from_utf8_lossy(chunk), "acknowledgment received");
                // Failure is already logged; the handshake stays consumed.
                let _ = runtime.block_on(self.complete_handshake());
            } else {
                trace!(chunk = %String::from_utf8_lossy(chunk), "no acknowledgment in chunk");
            }
        }

        info!("serial reader stopped");
        Ok(())
    }
}

#[async_trait]
impl BusHandler for HandshakeBridge {
    async fn on_connect(&self, bus: &dyn BusClient) -> Result<(), KioskError> {
        bus.subscribe(&self.config.ready_topic, QoS::AtLeastOnce).await?;
        info!(topic = %self.config.ready_topic, "subscribed to ready events");
        Ok(())
    }

    #[instrument(skip(self, message), fields(id = %message.id, topic = %message.topic))]
    async fn on_message(&self, message: BusMessage) -> Result<(), KioskError> {
        debug!(
            payload = %message.payload_str(),
            age_ms = message.age_ms(),
            "bus message received"
        );
        let bridge = self.clone();
        tokio::task::spawn_blocking(move || bridge.on_ready_event(&message.topic, &message.payload))
            .await
            .map_err(|e| KioskError::Channel(format!("ready handler task failed: {e}")))?
    }

    async fn on_disconnect(&self, reason: &str) {
        warn!(reason, armed = self.is_armed(), "bus disconnected");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reader handle
// ────────────────────────────────────────────────────────────────────────────

/// Owner's handle on a running reader thread.
pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Result<(), KioskError>>,
}

/// Cloneable stop signal for a reader, e.g. for a signal handler that must
/// not keep the bridge (and its serial channel) alive.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ReaderHandle {
    /// Same as [`HandshakeBridge::stop`].
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Whether the reader has exited (stopped or failed).
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the reader exits and return its outcome.
    ///
    /// # Errors
    ///
    /// The reader's fatal error, or [`KioskError::Channel`] if it panicked.
    pub fn join(self) -> Result<(), KioskError> {
        self.thread
            .join()
            .map_err(|_| KioskError::Channel("serial reader panicked".into()))?
    }
}
