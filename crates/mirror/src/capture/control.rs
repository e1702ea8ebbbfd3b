//! Control channel reader
//!
//! Input injection is out of scope, so nothing is ever written here. The
//! service still sends clipboard notifications which must be drained to
//! keep the channel flowing.

use crate::capture::tunnel::TunnelReader;
use bytes::{Buf, BytesMut};
use common::MirrorError;
use protocol::DeviceMessage;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Drain `control` until it ends, logging device messages
pub fn spawn_control_drain(mut control: TunnelReader) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = BytesMut::new();
        loop {
            let chunk = match control.read_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    debug!("Control channel closed");
                    return;
                }
                Err(e) => {
                    debug!("Control channel failed: {}", e);
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);
            if let Err(e) = drain_messages(&mut buffer) {
                warn!("Stopped reading control channel: {}", e);
                return;
            }
        }
    })
}

/// Parse and log every complete message in `buffer`
fn drain_messages(buffer: &mut BytesMut) -> Result<usize, MirrorError> {
    let mut count = 0;
    while let Some((message, used)) = DeviceMessage::parse(&buffer[..])? {
        buffer.advance(used);
        count += 1;
        match message {
            DeviceMessage::Clipboard { text } => {
                info!("Device clipboard changed ({} chars)", text.chars().count())
            }
            DeviceMessage::AckClipboard { sequence } => {
                debug!("Clipboard update {} acknowledged", sequence)
            }
            DeviceMessage::UhidOutput { id, data } => {
                debug!("UHID output for device {} ({} bytes)", id, data.len())
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_keeps_partial_message() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0, 7]);
        buffer.extend_from_slice(&[0, 0, 0, 0, 4, b'c', b'o']);

        assert_eq!(drain_messages(&mut buffer).unwrap(), 1);
        assert_eq!(buffer.len(), 7);

        buffer.extend_from_slice(b"py");
        assert_eq!(drain_messages(&mut buffer).unwrap(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_rejects_unknown_message() {
        let mut buffer = BytesMut::from(&[42u8, 0, 0][..]);
        assert!(matches!(
            drain_messages(&mut buffer),
            Err(MirrorError::ProtocolViolation(_))
        ));
    }
}
