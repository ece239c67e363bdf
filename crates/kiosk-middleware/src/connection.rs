//! [`ConnectionState`] – explicit bus connectivity shared by whoever needs it.
//!
//! The bus client owns the state and updates it as the broker connection
//! comes and goes; other components receive a clone and query or watch it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

/// Connectivity of a bus client.  Clone it cheaply – all clones observe the
/// same connection.
#[derive(Clone, Debug)]
pub struct ConnectionState {
    tx: Arc<watch::Sender<bool>>,
    connects: Arc<AtomicU64>,
}

impl ConnectionState {
    /// A state that starts disconnected.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            connects: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a successful (re)connection.  Returns `true` when this was a
    /// transition from disconnected.
    pub fn set_connected(&self) -> bool {
        let changed = self.tx.send_if_modified(|connected| {
            let was = *connected;
            *connected = true;
            !was
        });
        if changed {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
        changed
    }

    /// Record a lost connection.  Returns `true` when this was a transition
    /// from connected.
    pub fn set_disconnected(&self) -> bool {
        self.tx.send_if_modified(|connected| {
            let was = *connected;
            *connected = false;
            was
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    /// How many times the client has gone from disconnected to connected.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// A receiver that wakes on every connectivity change.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
