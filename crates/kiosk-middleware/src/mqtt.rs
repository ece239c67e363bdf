//! MQTT transport built on `rumqttc`.
//!
//! [`MqttBus::new`] returns two halves:
//!
//! * [`MqttBus`] – the cloneable [`BusClient`] used to publish and subscribe.
//! * [`MqttDriver`] – owns the network event loop.  [`MqttDriver::run`] polls
//!   it, keeps the shared [`ConnectionState`] current, re-runs
//!   [`BusHandler::on_connect`] after every CONNACK and dispatches incoming
//!   publishes to [`BusHandler::on_message`].
//!
//! Reconnection is handled here, not by the bridge: after a connection error
//! the driver waits `reconnect_delay` and polls again, which makes `rumqttc`
//! dial the broker anew.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiosk_types::{BusMessage, KioskError, QoS};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{BusClient, BusHandler};
use crate::connection::ConnectionState;

/// Broker connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Stored as plain text; restrict permissions on the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Capacity of the client's outgoing request queue.
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "parcel-bridge".to_string()
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_reconnect_delay_ms() -> u64 {
    1_000
}
fn default_request_capacity() -> usize {
    16
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl std::fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("request_capacity", &self.request_capacity)
            .finish()
    }
}

impl MqttSettings {
    /// Credentials are only used when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }

    /// # Errors
    ///
    /// Returns [`KioskError::Config`] for an empty host or client id, a zero
    /// port, or a keep-alive below the 5 s minimum `rumqttc` accepts.
    pub fn validate(&self) -> Result<(), KioskError> {
        if self.host.trim().is_empty() {
            return Err(KioskError::Config("mqtt host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(KioskError::Config("mqtt port must be non-zero".into()));
        }
        if self.client_id.is_empty() {
            return Err(KioskError::Config("mqtt client id must not be empty".into()));
        }
        if self.keep_alive_secs < 5 {
            return Err(KioskError::Config("mqtt keep-alive must be at least 5 s".into()));
        }
        if self.request_capacity == 0 {
            return Err(KioskError::Config("mqtt request capacity must be non-zero".into()));
        }
        Ok(())
    }

    fn to_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs));
        if let Some((user, pass)) = self.credentials() {
            options.set_credentials(user, pass);
        }
        options
    }
}

pub(crate) fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

pub(crate) fn from_mqtt_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Client half
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable MQTT client.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    connection: ConnectionState,
}

impl MqttBus {
    /// Build the client and its driver.  Nothing touches the network until
    /// [`MqttDriver::run`] is polled.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Config`] if `settings` do not validate.
    pub fn new(settings: &MqttSettings) -> Result<(Self, MqttDriver), KioskError> {
        settings.validate()?;
        let (client, eventloop) = AsyncClient::new(settings.to_options(), settings.request_capacity);
        let connection = ConnectionState::new();
        let bus = Self { client, connection };
        let driver = MqttDriver {
            eventloop,
            bus: bus.clone(),
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            broker: format!("{}:{}", settings.host, settings.port),
        };
        Ok((bus, driver))
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    /// Send a DISCONNECT so the broker drops the session cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Bus`] if the request queue is closed.
    pub async fn disconnect(&self) -> Result<(), KioskError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| KioskError::Bus(e.to_string()))
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), KioskError> {
        if !self.connection.is_connected() {
            warn!(topic, "publishing while disconnected; queued until the broker is back");
        }
        self.client
            .publish(topic, to_mqtt_qos(qos), false, payload)
            .await
            .map_err(|e| KioskError::Bus(format!("publish to '{topic}': {e}")))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), KioskError> {
        self.client
            .subscribe(filter, to_mqtt_qos(qos))
            .await
            .map_err(|e| KioskError::Bus(format!("subscribe to '{filter}': {e}")))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Driver half
// ────────────────────────────────────────────────────────────────────────────

/// Owns the `rumqttc` event loop.
pub struct MqttDriver {
    eventloop: EventLoop,
    bus: MqttBus,
    reconnect_delay: Duration,
    broker: String,
}

impl MqttDriver {
    /// Poll the event loop until `shutdown` flips to `true` (or its sender is
    /// dropped), dispatching to `handler`.
    pub async fn run(mut self, handler: Arc<dyn BusHandler>, mut shutdown: watch::Receiver<bool>) {
        info!(broker = %self.broker, "mqtt driver started");
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(packet)) => self.handle_packet(packet, &handler).await,
                        Ok(Event::Outgoing(outgoing)) => {
                            debug!(?outgoing, "mqtt outgoing");
                        }
                        Err(e) => {
                            if self.bus.connection.set_disconnected() {
                                handler.on_disconnect(&e.to_string()).await;
                            }
                            error!(broker = %self.broker, error = %e, "mqtt connection error; retrying");
                            tokio::time::sleep(self.reconnect_delay).await;
                        }
                    }
                }
            }
        }
        self.bus.connection.set_disconnected();
        info!("mqtt driver stopped");
    }

    async fn handle_packet(&mut self, packet: Packet, handler: &Arc<dyn BusHandler>) {
        match packet {
            Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                self.bus.connection.set_connected();
                info!(
                    broker = %self.broker,
                    session_present = ack.session_present,
                    "mqtt connected"
                );
                spawn_connect_handler(self.bus.clone(), Arc::clone(handler));
            }
            Packet::ConnAck(ack) => {
                error!(broker = %self.broker, code = ?ack.code, "mqtt connect refused");
            }
            Packet::Publish(publish) => {
                let message = BusMessage::new(
                    publish.topic,
                    publish.payload.to_vec(),
                    from_mqtt_qos(publish.qos),
                );
                debug!(topic = %message.topic, payload = %message.payload_str(), "mqtt rx");
                let handler = Arc::clone(handler);
                tokio::spawn(async move {
                    let topic = message.topic.clone();
                    if let Err(e) = handler.on_message(message).await {
                        warn!(topic = %topic, error = %e, "message handler failed");
                    }
                });
            }
            Packet::Disconnect => {
                if self.bus.connection.set_disconnected() {
                    handler.on_disconnect("broker sent DISCONNECT").await;
                }
            }
            other => debug!(packet = ?other, "mqtt incoming"),
        }
    }
}

/// Run `on_connect` on its own task.  Its subscribe requests go through the
/// client's bounded request queue, which only drains while the event loop is
/// polled, so awaiting them inline could stall the driver for good.
fn spawn_connect_handler(bus: MqttBus, handler: Arc<dyn BusHandler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = handler.on_connect(&bus).await {
            error!(error = %e, "on_connect handler failed");
        }
    })
}
