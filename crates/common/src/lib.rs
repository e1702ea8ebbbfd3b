//! Common utilities for usb-mirror
//!
//! This crate provides shared functionality between the mirroring core and
//! the command-line front end: the error taxonomy, logging setup, the host
//! authentication key, USB device descriptions, and the async channel bridge
//! for the USB I/O thread.

pub mod channel;
pub mod error;
pub mod keys;
pub mod logging;
pub mod usb_types;

pub use channel::{UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{MirrorError, Result, TransportError};
pub use keys::{HostKey, KeyError};
pub use logging::setup_logging;
pub use usb_types::DeviceInfo;
