//! `kiosk-hal` – Hardware Abstraction for the pickup locker controller.
//!
//! The rest of the stack only ever talks to the [`SerialChannel`] trait, so
//! the physical port can be swapped for the in-memory simulator in tests.
//!
//! # Modules
//!
//! - [`serial`] – the [`SerialChannel`] trait and its [`SerialConfig`].
//! - [`native`] – [`NativeSerial`], a driver for real ports built on the
//!   `serialport` crate.
//! - [`sim`] – [`SimSerial`], a scripted in-process device for headless runs
//!   and tests.

pub mod native;
pub mod serial;
pub mod sim;

pub use native::NativeSerial;
pub use serial::{SerialChannel, SerialConfig};
pub use sim::SimSerial;
