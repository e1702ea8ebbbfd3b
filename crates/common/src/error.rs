//! Common error types
//!
//! `TransportError` covers the USB layer only. `MirrorError` is the taxonomy
//! surfaced by a mirroring session; every lower-level error converts into it.

use protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by a byte transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("No device selected")]
    NoDeviceSelected,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("USB I/O error: {0}")]
    Io(String),
}

/// Session-level error taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorError {
    #[error("No device selected")]
    NoDeviceSelected,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Capture service unavailable: {0}")]
    CaptureServiceUnavailable(String),

    /// A single access unit failed to decode; the pipeline skips it
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Video pipeline failure: {0}")]
    PipelineFailure(String),

    /// No decoder for the announced codec is compiled into this build
    #[error("Unsupported video codec: {0}")]
    UnsupportedCodec(String),

    #[error("A session is already active")]
    AlreadyActive,

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MirrorError {
    /// Short machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            MirrorError::NoDeviceSelected => "no_device_selected",
            MirrorError::PermissionDenied(_) => "permission_denied",
            MirrorError::DeviceBusy(_) => "device_busy",
            MirrorError::Disconnected => "disconnected",
            MirrorError::Io(_) => "io",
            MirrorError::ProtocolViolation(_) => "protocol_violation",
            MirrorError::Unauthorized(_) => "unauthorized",
            MirrorError::CaptureServiceUnavailable(_) => "capture_service_unavailable",
            MirrorError::DecodeError(_) => "decode_error",
            MirrorError::PipelineFailure(_) => "pipeline_failure",
            MirrorError::UnsupportedCodec(_) => "unsupported_codec",
            MirrorError::AlreadyActive => "already_active",
            MirrorError::Cancelled => "cancelled",
            MirrorError::Config(_) => "config",
        }
    }

    /// Whether the session can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MirrorError::DecodeError(_))
    }
}

impl From<TransportError> for MirrorError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NoDeviceSelected => MirrorError::NoDeviceSelected,
            TransportError::PermissionDenied(msg) => MirrorError::PermissionDenied(msg),
            TransportError::DeviceBusy(msg) => MirrorError::DeviceBusy(msg),
            TransportError::Disconnected => MirrorError::Disconnected,
            TransportError::Io(msg) => MirrorError::Io(msg),
        }
    }
}

impl From<ProtocolError> for MirrorError {
    fn from(err: ProtocolError) -> Self {
        MirrorError::ProtocolViolation(err.to_string())
    }
}

impl From<std::io::Error> for MirrorError {
    fn from(err: std::io::Error) -> Self {
        MirrorError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
