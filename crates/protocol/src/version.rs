//! Protocol version and connection limits

/// Oldest protocol version a device may announce
pub const MIN_VERSION: u32 = 0x0100_0000;

/// Version from which peers are allowed to send zero payload checksums
pub const VERSION_SKIP_CHECKSUM: u32 = 0x0100_0001;

/// Version the host announces in its CNXN frame.
///
/// Announcing the checksum-carrying version keeps the device computing
/// payload checksums, so every received frame can be verified.
pub const HOST_VERSION: u32 = MIN_VERSION;

/// Largest payload the host accepts (256 KiB)
pub const HOST_MAX_PAYLOAD: usize = 256 * 1024;

/// Payload limit used by legacy devices before negotiation
pub const LEGACY_MAX_PAYLOAD: usize = 4096;

/// Features the host announces in its banner
pub const HOST_FEATURES: &[&str] = &["shell_v2", "cmd"];

/// Negotiated connection parameters, taken from the device CNXN frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Version announced by the device
    pub version: u32,
    /// Effective maximum payload (`min(host, device)`)
    pub max_payload: usize,
}

impl ConnectionParams {
    /// Negotiate parameters from the device's CNXN arguments
    pub fn negotiate(device_version: u32, device_max_payload: u32) -> crate::Result<Self> {
        if device_version < MIN_VERSION {
            return Err(crate::ProtocolError::IncompatibleVersion {
                version: device_version,
                minimum: MIN_VERSION,
            });
        }

        let device_max = if device_max_payload == 0 {
            LEGACY_MAX_PAYLOAD
        } else {
            device_max_payload as usize
        };

        Ok(Self {
            version: device_version,
            max_payload: device_max.min(HOST_MAX_PAYLOAD),
        })
    }
}

/// Build the host banner sent as the CNXN payload
pub fn host_banner() -> String {
    format!("host::features={}", HOST_FEATURES.join(","))
}
