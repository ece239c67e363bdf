//! The bus client seam.
//!
//! The bridge never speaks MQTT directly.  It publishes and subscribes
//! through [`BusClient`], and the client's dispatcher calls back into a
//! [`BusHandler`].
//!
//! # Overview
//!
//! - [`BusClient`] – publish/subscribe operations every transport provides.
//! - [`BusHandler`] – callbacks a dispatcher invokes.  Every callback returns
//!   a `Result`; dispatchers log failures instead of discarding them.
//! - [`LocalBus`][crate::bus::LocalBus] – in-process transport.
//! - [`MqttBus`][crate::mqtt::MqttBus] – broker-backed transport.

use async_trait::async_trait;
use kiosk_types::{BusMessage, KioskError, QoS};

/// Every pub/sub transport must implement this trait.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Hand `payload` to the transport for delivery on `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), KioskError>;

    /// Register interest in `filter` (MQTT-style, `+` and `#` wildcards).
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), KioskError>;
}

/// Callbacks invoked by a bus dispatcher.
///
/// Implementations must not block the dispatcher: long-running or blocking
/// work belongs on a blocking task or a dedicated thread.
#[async_trait]
pub trait BusHandler: Send + Sync {
    /// Called after every successful (re)connection.  Subscriptions do not
    /// survive a session reset, so this is where they are (re)established.
    async fn on_connect(&self, bus: &dyn BusClient) -> Result<(), KioskError>;

    /// Called for every message delivered on a subscribed topic.
    async fn on_message(&self, message: BusMessage) -> Result<(), KioskError>;

    /// Called when the connection drops.
    async fn on_disconnect(&self, reason: &str) {
        let _ = reason;
    }
}
