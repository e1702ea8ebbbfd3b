//! Mirroring core for Android devices attached over USB
//!
//! Layers, bottom to top:
//!
//! - [`usb`]: finds the device bridge interface and exposes it as a
//!   [`Transport`](usb::Transport)
//! - [`bridge`]: CNXN/AUTH handshake and stream multiplexing
//! - [`capture`]: installs and launches the capture service, sets up its
//!   video and control channels
//! - [`video`]: demux, decode and latest-frame presentation
//! - [`session`]: the controller tying it all together
//!
//! A front end only needs [`SessionController`], a
//! [`DeviceChooser`](usb::DeviceChooser) and a draw callback.

pub mod bridge;
pub mod capture;
pub mod config;
pub mod session;
pub mod test_utils;
pub mod usb;
pub mod video;

pub use capture::{CaptureParams, TunnelMode};
pub use config::MirrorConfig;
pub use session::{
    EventSink, SessionController, SessionEvent, SessionHandle, SessionOptions, SessionState,
    Severity,
};
pub use usb::{DeviceChooser, DeviceSelector, UsbDeviceProvider};
pub use video::{DecodedFrame, DrawCallback, StatsSnapshot};
