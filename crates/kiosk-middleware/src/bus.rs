//! Headless, in-process, topic-routed publish/subscribe bus.
//!
//! Uses a [`tokio::sync::broadcast`] channel under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  [`LocalBus`] implements [`BusClient`] and can drive a
//! [`BusHandler`] exactly like the MQTT dispatcher does, which lets the whole
//! bridge run in tests and offline without a broker.
//!
//! # Topic filters
//!
//! Subscriptions use MQTT filter syntax:
//!
//! | Filter | Matches |
//! |---|---|
//! | `kiosk/pickup/box_delivered` | that exact topic |
//! | `kiosk/+/box_delivered` | one level wildcard |
//! | `kiosk/#` | `kiosk` and everything below it |

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use kiosk_types::{BusMessage, KioskError, QoS};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::client::{BusClient, BusHandler};
use crate::connection::ConnectionState;

/// Default channel capacity (number of buffered messages before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Whether `topic` matches the MQTT-style `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Shared in-process bus.  Clone it cheaply – all clones share the same
/// channel, subscriptions and connection state.
#[derive(Clone, Debug)]
pub struct LocalBus {
    sender: broadcast::Sender<BusMessage>,
    subscriptions: Arc<RwLock<HashMap<String, QoS>>>,
    connection: ConnectionState,
}

impl LocalBus {
    /// Create a connected bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let connection = ConnectionState::new();
        connection.set_connected();
        Self {
            sender,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            connection,
        }
    }

    /// Publish a fully-formed message.
    ///
    /// Returns the number of receivers that were handed the message.
    ///
    /// # Errors
    ///
    /// [`KioskError::BusUnavailable`] while disconnected, and
    /// [`KioskError::Channel`] when nobody is listening.
    pub fn publish_message(&self, message: BusMessage) -> Result<usize, KioskError> {
        if !self.connection.is_connected() {
            return Err(KioskError::BusUnavailable(format!(
                "local bus disconnected; dropped publish to '{}'",
                message.topic
            )));
        }
        self.sender
            .send(message)
            .map_err(|e| KioskError::Channel(format!("No subscribers for topic '{}'", e.0.topic)))
    }

    /// Observe every message whose topic matches `filter`, independent of the
    /// dispatcher's subscriptions.
    pub fn subscribe_topic(&self, filter: impl Into<String>) -> TopicSubscriber {
        TopicSubscriber {
            filter: filter.into(),
            receiver: self.sender.subscribe(),
        }
    }

    /// The connectivity object for this bus.
    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    /// Simulate a broker-side session reset: the link drops and every
    /// subscription is forgotten.
    pub fn disconnect(&self) {
        self.write_subscriptions().clear();
        if self.connection.set_disconnected() {
            info!("local bus disconnected");
        }
    }

    /// Bring the link back up.  A running dispatcher re-invokes
    /// [`BusHandler::on_connect`].
    pub fn reconnect(&self) {
        if self.connection.set_connected() {
            info!("local bus reconnected");
        }
    }

    /// Filters currently registered through [`BusClient::subscribe`].
    pub fn subscriptions(&self) -> Vec<String> {
        let subs = self
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.keys().cloned().collect()
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        let subs = self
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.keys().any(|filter| topic_matches(filter, topic))
    }

    fn write_subscriptions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, QoS>> {
        self.subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Dispatch subscribed traffic to `handler` until `shutdown` flips to
    /// `true` (or its sender is dropped).
    ///
    /// `on_connect` runs immediately when connected and again after every
    /// reconnect; each message is handled on its own task so a slow handler
    /// never stalls the dispatcher.
    pub async fn run(&self, handler: Arc<dyn BusHandler>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.sender.subscribe();
        let mut link = self.connection.watch();

        if *link.borrow_and_update() {
            self.connect_handler(handler.as_ref()).await;
        }

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = link.changed() => {
                    if res.is_err() {
                        break;
                    }
                    let connected = *link.borrow_and_update();
                    if connected {
                        self.connect_handler(handler.as_ref()).await;
                    } else {
                        handler.on_disconnect("local bus disconnected").await;
                    }
                }
                received = rx.recv() => {
                    match received {
                        Ok(message) => {
                            if !self.is_subscribed(&message.topic) {
                                continue;
                            }
                            let handler = Arc::clone(&handler);
                            tokio::spawn(async move {
                                let topic = message.topic.clone();
                                if let Err(e) = handler.on_message(message).await {
                                    warn!(topic = %topic, error = %e, "message handler failed");
                                }
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged_by = n, "local bus dispatcher lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!("local bus dispatcher stopped");
    }

    async fn connect_handler(&self, handler: &dyn BusHandler) {
        if let Err(e) = handler.on_connect(self).await {
            warn!(error = %e, "on_connect handler failed");
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl BusClient for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), KioskError> {
        self.publish_message(BusMessage::new(topic, payload, qos))
            .map(|_| ())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), KioskError> {
        if !self.connection.is_connected() {
            return Err(KioskError::BusUnavailable(format!(
                "cannot subscribe to '{filter}' while disconnected"
            )));
        }
        self.write_subscriptions().insert(filter.to_string(), qos);
        debug!(filter, ?qos, "local bus subscription added");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Filtered receiver
// ---------------------------------------------------------------------------

/// A receiver that only yields messages whose topic matches its filter.
pub struct TopicSubscriber {
    filter: String,
    receiver: broadcast::Receiver<BusMessage>,
}

impl TopicSubscriber {
    /// Wait for the next matching message.
    ///
    /// Returns `None` when the bus is closed and no further messages will
    /// arrive.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if topic_matches(&self.filter, &message.topic) => {
                    return Some(message);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(filter = %self.filter, lagged_by = n, "TopicSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return a matching message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) if topic_matches(&self.filter, &message.topic) => {
                    return Some(message);
                }
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
