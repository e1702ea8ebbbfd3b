//! Bulk transfer helpers
//!
//! Synchronous wrappers used by the I/O thread, plus the mapping from rusb
//! errors to transport errors.

use common::TransportError;
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for a single bulk OUT transfer
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read one bulk IN transfer
///
/// Returns `Ok(None)` when nothing arrived within `timeout`; the caller
/// polls again.
pub fn read_bulk_chunk(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    buffer: &mut [u8],
    timeout: Duration,
) -> Result<Option<usize>, TransportError> {
    match handle.read_bulk(endpoint, buffer, timeout) {
        Ok(len) => Ok(Some(len)),
        Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => Ok(None),
        Err(e) => {
            warn!("Bulk IN on {:#04x} failed: {}", endpoint, e);
            Err(map_rusb_error(e))
        }
    }
}

/// Write all of `data` to a bulk OUT endpoint
///
/// A transfer whose length is a multiple of the endpoint packet size is
/// terminated with a zero-length packet so the device sees its end.
pub fn write_bulk_all(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    data: &[u8],
    max_packet_size: u16,
) -> Result<usize, TransportError> {
    let mut written = 0;
    while written < data.len() {
        match handle.write_bulk(endpoint, &data[written..], WRITE_TIMEOUT) {
            Ok(0) => {
                return Err(TransportError::Io(
                    "bulk OUT transfer made no progress".to_string(),
                ));
            }
            Ok(len) => written += len,
            Err(e) => {
                warn!("Bulk OUT on {:#04x} failed: {}", endpoint, e);
                return Err(map_rusb_error(e));
            }
        }
    }

    if needs_zero_length_packet(data.len(), max_packet_size) {
        debug!("Sending zero-length packet after {} bytes", data.len());
        handle
            .write_bulk(endpoint, &[], WRITE_TIMEOUT)
            .map_err(map_rusb_error)?;
    }

    Ok(written)
}

/// Whether a transfer of `len` bytes needs a trailing zero-length packet
pub fn needs_zero_length_packet(len: usize, max_packet_size: u16) -> bool {
    max_packet_size > 0 && len > 0 && len % max_packet_size as usize == 0
}

/// Map rusb::Error to TransportError
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Access => TransportError::PermissionDenied(
            "no permission to open the device (check udev rules)".to_string(),
        ),
        rusb::Error::Busy => TransportError::DeviceBusy(
            "interface is claimed by another program (is an adb server running?)".to_string(),
        ),
        rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::Disconnected,
        other => TransportError::Io(other.to_string()),
    }
}
