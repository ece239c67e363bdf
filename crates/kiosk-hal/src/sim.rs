//! In-process serial simulator for CI/CD testing without a controller board.
//!
//! [`SimSerial`] plays the part of the locker controller: tests (or a
//! headless run) queue the bytes the controller "sends", and every command
//! the bridge writes is recorded for later inspection.  Clones share the same
//! device, so one clone can be handed to the bridge while another drives it.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use kiosk_hal::{SerialChannel, SimSerial};
//!
//! let device = SimSerial::new(Duration::from_millis(10));
//! device.push_chunk(b"done\r\n");
//!
//! let mut buf = [0u8; 64];
//! let n = device.read_chunk(&mut buf).unwrap();
//! assert_eq!(&buf[..n], b"done\r\n");
//!
//! device.write_all(b"o\n").unwrap();
//! assert_eq!(device.written(), vec![b"o\n".to_vec()]);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use kiosk_types::KioskError;

use crate::serial::SerialChannel;

// ────────────────────────────────────────────────────────────────────────────
// Scripted input
// ────────────────────────────────────────────────────────────────────────────

enum SimRead {
    Bytes(Vec<u8>),
    Fail(String),
}

#[derive(Default)]
struct SimState {
    inbound: VecDeque<SimRead>,
    written: Vec<Vec<u8>>,
    failing_writes: usize,
}

struct SimInner {
    id: String,
    read_timeout: Duration,
    state: Mutex<SimState>,
    data_ready: Condvar,
    reads: AtomicUsize,
}

// ────────────────────────────────────────────────────────────────────────────
// SimSerial
// ────────────────────────────────────────────────────────────────────────────

/// A simulated serial device.  Cheap to clone; all clones share one device.
#[derive(Clone)]
pub struct SimSerial {
    inner: Arc<SimInner>,
}

impl SimSerial {
    /// Create a simulator whose reads wait at most `read_timeout`.
    pub fn new(read_timeout: Duration) -> Self {
        Self::with_id("sim://controller", read_timeout)
    }

    pub fn with_id(id: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SimInner {
                id: id.into(),
                read_timeout,
                state: Mutex::new(SimState::default()),
                data_ready: Condvar::new(),
                reads: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue bytes the controller emits.  They are returned by subsequent
    /// reads, split to the reader's buffer size if necessary.
    pub fn push_chunk(&self, bytes: impl AsRef<[u8]>) {
        self.push(SimRead::Bytes(bytes.as_ref().to_vec()));
    }

    /// Queue a read failure; the read that reaches it returns
    /// [`KioskError::SerialRead`].
    pub fn push_read_error(&self, reason: impl Into<String>) {
        self.push(SimRead::Fail(reason.into()));
    }

    /// Make the next `count` writes fail with [`KioskError::SerialWrite`].
    pub fn fail_next_writes(&self, count: usize) {
        self.lock_state().failing_writes = count;
    }

    /// Every successful write, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock_state().written.clone()
    }

    /// Number of `read_chunk` calls made so far.
    pub fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Whether every queued chunk has been consumed.
    pub fn drained(&self) -> bool {
        self.lock_state().inbound.is_empty()
    }

    fn push(&self, item: SimRead) {
        self.lock_state().inbound.push_back(item);
        self.inner.data_ready.notify_all();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SimState> {
        // The simulator never panics while holding the lock; recover the
        // guard if a test thread did.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SerialChannel for SimSerial {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, KioskError> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);

        let state = self.lock_state();
        let (mut state, _) = self
            .inner
            .data_ready
            .wait_timeout_while(state, self.inner.read_timeout, |s| s.inbound.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match state.inbound.pop_front() {
            None => Ok(0),
            Some(SimRead::Fail(reason)) => {
                Err(KioskError::SerialRead(format!("{}: {reason}", self.inner.id)))
            }
            Some(SimRead::Bytes(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    state.inbound.push_front(SimRead::Bytes(bytes.split_off(n)));
                }
                Ok(n)
            }
        }
    }

    fn write_all(&self, bytes: &[u8]) -> Result<(), KioskError> {
        let mut state = self.lock_state();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(KioskError::SerialWrite(format!(
                "{}: simulated write failure",
                self.inner.id
            )));
        }
        state.written.push(bytes.to_vec());
        Ok(())
    }

    fn read_timeout(&self) -> Duration {
        self.inner.read_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn empty_read_waits_for_timeout() {
        let device = SimSerial::new(Duration::from_millis(20));
        let mut buf = [0u8; 8];
        let started = Instant::now();
        assert_eq!(device.read_chunk(&mut buf).unwrap(), 0);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(device.reads(), 1);
    }

    #[test]
    fn push_wakes_a_blocked_reader() {
        let device = SimSerial::new(Duration::from_secs(5));
        let feeder = device.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            feeder.push_chunk(b"DONE");
        });

        let mut buf = [0u8; 8];
        let started = Instant::now();
        let n = device.read_chunk(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"DONE");
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn oversized_chunk_is_split_across_reads() {
        let device = SimSerial::new(Duration::from_millis(5));
        device.push_chunk(b"abcdef");

        let mut buf = [0u8; 4];
        let n = device.read_chunk(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = device.read_chunk(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ef");
        assert!(device.drained());
    }

    #[test]
    fn scripted_read_error_is_reported() {
        let device = SimSerial::new(Duration::from_millis(5));
        device.push_read_error("cable unplugged");
        let mut buf = [0u8; 4];
        let err = device.read_chunk(&mut buf).unwrap_err();
        assert!(matches!(err, KioskError::SerialRead(ref m) if m.contains("cable unplugged")));
    }

    #[test]
    fn failing_writes_are_not_recorded() {
        let device = SimSerial::new(Duration::from_millis(5));
        device.fail_next_writes(1);

        assert!(matches!(device.write_all(b"o\n"), Err(KioskError::SerialWrite(_))));
        device.write_all(b"o\n").unwrap();
        assert_eq!(device.written(), vec![b"o\n".to_vec()]);
    }
}
