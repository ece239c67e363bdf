//! [`NativeSerial`] – a [`SerialChannel`] backed by a real OS serial port.
//!
//! The port is opened once and cloned into two handles so the reader thread
//! and the command writer never contend for the same lock.

use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use kiosk_types::KioskError;
use serialport::SerialPort;
use tracing::{debug, info};

use crate::serial::{SerialChannel, SerialConfig};

pub struct NativeSerial {
    id: String,
    read_timeout: Duration,
    reader: Mutex<Box<dyn SerialPort>>,
    writer: Mutex<Box<dyn SerialPort>>,
}

impl NativeSerial {
    /// Open the port described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Config`] for invalid settings and
    /// [`KioskError::SerialOpen`] when the device cannot be opened or cloned.
    pub fn open(config: &SerialConfig) -> Result<Self, KioskError> {
        config.validate()?;

        let open_err = |e: serialport::Error| KioskError::SerialOpen {
            port: config.port.clone(),
            details: e.to_string(),
        };

        let reader = serialport::new(&config.port, config.baud)
            .timeout(config.read_timeout())
            .open()
            .map_err(open_err)?;
        let writer = reader.try_clone().map_err(open_err)?;

        info!(port = %config.port, baud = config.baud, "serial port opened");

        Ok(Self {
            id: config.port.clone(),
            read_timeout: config.read_timeout(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

impl SerialChannel for NativeSerial {
    fn id(&self) -> &str {
        &self.id
    }

    fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, KioskError> {
        let mut port = self
            .reader
            .lock()
            .map_err(|_| KioskError::SerialRead(format!("{}: reader lock poisoned", self.id)))?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(KioskError::SerialRead(format!("{}: {e}", self.id))),
        }
    }

    fn write_all(&self, bytes: &[u8]) -> Result<(), KioskError> {
        let mut port = self
            .writer
            .lock()
            .map_err(|_| KioskError::SerialWrite(format!("{}: writer lock poisoned", self.id)))?;
        port.write_all(bytes)
            .and_then(|()| port.flush())
            .map_err(|e| KioskError::SerialWrite(format!("{}: {e}", self.id)))?;
        debug!(port = %self.id, bytes = ?String::from_utf8_lossy(bytes), "serial write flushed");
        Ok(())
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}
