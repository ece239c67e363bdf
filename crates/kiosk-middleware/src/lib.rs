//! `kiosk-middleware` – The Nervous System
//!
//! Routes events between the pub/sub bus and the locker controller's serial
//! link without caring about anything but topics, bytes and one flag.
//!
//! # Modules
//!
//! - [`client`] – the [`BusClient`] / [`BusHandler`] seam every transport
//!   implements.
//! - [`bus`] – [`LocalBus`], a headless, in-process, topic-routed bus built on
//!   Tokio broadcast channels.
//! - [`mqtt`] – [`MqttBus`], the broker-backed transport.
//! - [`connection`] – [`ConnectionState`], explicit connectivity shared with
//!   whoever needs it.
//! - [`ack`] – [`AckMatcher`], case-insensitive acknowledgment detection.
//! - [`bridge`] – [`HandshakeBridge`], the ready → command → ack → completion
//!   handshake.

pub mod ack;
pub mod bridge;
pub mod bus;
pub mod client;
pub mod connection;
pub mod mqtt;

pub use ack::AckMatcher;
pub use bridge::{BridgeConfig, HandshakeBridge, ReaderHandle, StopHandle};
pub use bus::{LocalBus, TopicSubscriber, topic_matches};
pub use client::{BusClient, BusHandler};
pub use connection::ConnectionState;
pub use mqtt::{MqttBus, MqttDriver, MqttSettings};
