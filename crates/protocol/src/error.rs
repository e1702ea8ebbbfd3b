//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
///
/// Every variant describes a malformed or out-of-sequence byte stream.
/// Callers treat them as fatal to the whole bridge connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Command word is not one of the known bridge commands
    #[error("Unknown command: {0:#010x}")]
    UnknownCommand(u32),

    /// Header magic does not match `command ^ 0xffffffff`
    #[error("Invalid magic for command {command:#010x}: {magic:#010x}")]
    InvalidMagic { command: u32, magic: u32 },

    /// Payload checksum does not match the header
    #[error("Checksum mismatch: header says {expected:#x}, payload sums to {computed:#x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// Declared payload length exceeds the negotiated maximum
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Incomplete frame data
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Incompatible protocol version announced by the peer
    #[error("Incompatible protocol version: {version:#010x} (minimum {minimum:#010x})")]
    IncompatibleVersion { version: u32, minimum: u32 },

    /// A capture-service record could not be parsed
    #[error("Malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}

impl ProtocolError {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            what,
            reason: reason.into(),
        }
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::ChecksumMismatch {
            expected: 0x10,
            computed: 0x11,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Checksum mismatch"));
        assert!(msg.contains("0x10"));
        assert!(msg.contains("0x11"));
    }

    #[test]
    fn test_payload_too_large_error() {
        let err = ProtocolError::PayloadTooLarge {
            size: 10_000_000,
            max: 262_144,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Payload too large"));
    }
}
