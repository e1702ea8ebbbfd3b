//! Device bridge protocol engine
//!
//! Runs the CNXN/AUTH handshake over a [`Transport`](crate::usb::Transport)
//! and then multiplexes logical streams over it. One reader task and one
//! writer task own the transport; streams talk to them through channels.

pub mod auth;
pub mod engine;
pub mod handshake;
pub mod stream;

pub use auth::{AuthStep, Authenticator};
pub use engine::{BridgeConnection, BridgeOptions, LinkStatus};
pub use handshake::HandshakeProgress;
pub use stream::{LogicalStream, StreamState};

use common::MirrorError;
use std::time::Duration;
use thiserror::Error;

/// Errors from opening or using a logical stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("Device rejected stream to {destination}")]
    Rejected { destination: String },

    #[error("No reply to OPEN {destination} within {timeout:?}")]
    Timeout {
        destination: String,
        timeout: Duration,
    },

    #[error("Stream is not open")]
    StreamNotOpen,

    /// The whole connection failed
    #[error(transparent)]
    Link(#[from] MirrorError),
}

impl From<BridgeError> for MirrorError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Link(e) => e,
            BridgeError::StreamNotOpen => MirrorError::Io("stream is not open".to_string()),
            other => MirrorError::CaptureServiceUnavailable(other.to_string()),
        }
    }
}
