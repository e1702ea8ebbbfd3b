//! Payload integrity checks for bridge frames
//!
//! The bridge protocol protects each payload with a simple additive
//! checksum: the unsigned sum of every payload byte, truncated to 32 bits.
//! The checksum is carried in the frame header and verified before a frame
//! is accepted.
//!
//! # Usage
//!
//! ```
//! use protocol::integrity::{compute_checksum, verify_checksum};
//!
//! let payload = b"host::features=shell_v2";
//! let checksum = compute_checksum(payload);
//! assert!(verify_checksum(payload, checksum));
//! ```

/// Compute the additive payload checksum
#[inline]
pub fn compute_checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |sum, byte| sum.wrapping_add(u32::from(*byte)))
}

/// Verify the additive payload checksum
#[inline]
pub fn verify_checksum(data: &[u8], expected_checksum: u32) -> bool {
    compute_checksum(data) == expected_checksum
}
