//! Mirroring control client
//!
//! Installs and launches the remote capture service, then normalises its
//! tunnel into one control channel and one video channel.

pub mod client;
pub mod control;
pub mod params;
pub mod push;
pub mod tunnel;

pub use client::{CaptureClient, CaptureTunnel, VideoMeta};
pub use control::spawn_control_drain;
pub use params::{CaptureParams, ServiceInstall, TunnelMode};
pub use tunnel::{OutputSink, ServiceMonitor, ServiceStatus, TunnelReader};
