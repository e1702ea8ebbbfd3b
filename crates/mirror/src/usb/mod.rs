//! USB transport
//!
//! Finds the device bridge interface on an attached phone, claims it, and
//! exposes it as an ordered byte stream.
//!
//! Bulk transfers run on a dedicated `usb-io` thread (one per open device)
//! and reach the Tokio runtime through the channel bridge in
//! `common::channel`. Everything above this module only sees the
//! [`Transport`] trait, so tests substitute in-memory transports.

pub mod device;
pub mod manager;
pub mod transfers;
pub mod transport;
pub mod worker;

pub use device::{BridgeInterface, UsbDevice};
pub use manager::{
    DeviceChooser, DeviceManager, DeviceProvider, DeviceSelector, FirstDevice, UsbDeviceProvider,
};
pub use transport::{Transport, UsbTransport};
