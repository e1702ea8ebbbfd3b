//! Service output framing
//!
//! Two record formats arrive over the stream that launched the capture
//! service:
//!
//! - shell v2 packets (`[id u8][len u32 LE][data]`), used when the device
//!   advertises the `shell_v2` feature, which separate stdout, stderr and the
//!   exit status;
//! - inline sub-frames (`[channel u8][len u32 BE][data]`), used by services
//!   that multiplex control and video inside their stdout.
//!
//! Both decoders are incremental: they accept arbitrary slices and yield
//! complete records.

use crate::{ProtocolError, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{Buf, Bytes, BytesMut};

const SHELL_HEADER_LEN: usize = 5;
const SUB_FRAME_HEADER_LEN: usize = 5;

/// Largest inline sub-frame accepted (a full video packet can be large)
pub const MAX_SUB_FRAME: usize = 8 * 1024 * 1024;

/// One shell v2 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellPacket {
    Stdin(Bytes),
    Stdout(Bytes),
    Stderr(Bytes),
    /// Exit status of the remote command
    Exit(u8),
    CloseStdin,
    WindowSizeChange(Bytes),
}

/// Incremental shell v2 packet decoder
#[derive(Debug, Default)]
pub struct ShellV2Decoder {
    buffer: BytesMut,
}

impl ShellV2Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn next_packet(&mut self) -> Result<Option<ShellPacket>> {
        if self.buffer.len() < SHELL_HEADER_LEN {
            return Ok(None);
        }
        let id = self.buffer[0];
        let len = LittleEndian::read_u32(&self.buffer[1..5]) as usize;
        if self.buffer.len() < SHELL_HEADER_LEN + len {
            return Ok(None);
        }
        self.buffer.advance(SHELL_HEADER_LEN);
        let data = self.buffer.split_to(len).freeze();

        let packet = match id {
            0 => ShellPacket::Stdin(data),
            1 => ShellPacket::Stdout(data),
            2 => ShellPacket::Stderr(data),
            3 => ShellPacket::Exit(data.first().copied().unwrap_or(0)),
            4 => ShellPacket::CloseStdin,
            5 => ShellPacket::WindowSizeChange(data),
            other => {
                return Err(ProtocolError::malformed(
                    "shell v2 packet",
                    format!("unknown id {}", other),
                ));
            }
        };
        Ok(Some(packet))
    }
}

/// Encode a shell v2 packet (used by test peers)
pub fn encode_shell_packet(packet: &ShellPacket) -> Vec<u8> {
    let (id, data): (u8, &[u8]) = match packet {
        ShellPacket::Stdin(d) => (0, &d[..]),
        ShellPacket::Stdout(d) => (1, &d[..]),
        ShellPacket::Stderr(d) => (2, &d[..]),
        ShellPacket::Exit(code) => (3, std::slice::from_ref(code)),
        ShellPacket::CloseStdin => (4, &[][..]),
        ShellPacket::WindowSizeChange(d) => (5, &d[..]),
    };
    let mut out = Vec::with_capacity(SHELL_HEADER_LEN + data.len());
    out.push(id);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Channel carried by an inline sub-frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubChannel {
    Control,
    Video,
}

impl SubChannel {
    pub fn id(self) -> u8 {
        match self {
            SubChannel::Control => 0,
            SubChannel::Video => 1,
        }
    }
}

/// Incremental inline sub-frame decoder
#[derive(Debug, Default)]
pub struct SubFrameDecoder {
    buffer: BytesMut,
}

impl SubFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn next_sub_frame(&mut self) -> Result<Option<(SubChannel, Bytes)>> {
        if self.buffer.len() < SUB_FRAME_HEADER_LEN {
            return Ok(None);
        }
        let channel = match self.buffer[0] {
            0 => SubChannel::Control,
            1 => SubChannel::Video,
            other => {
                return Err(ProtocolError::malformed(
                    "inline sub-frame",
                    format!("unknown channel {}", other),
                ));
            }
        };
        let len = BigEndian::read_u32(&self.buffer[1..5]) as usize;
        if len > MAX_SUB_FRAME {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: MAX_SUB_FRAME,
            });
        }
        if self.buffer.len() < SUB_FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        self.buffer.advance(SUB_FRAME_HEADER_LEN);
        Ok(Some((channel, self.buffer.split_to(len).freeze())))
    }
}

/// Encode an inline sub-frame (used by test peers)
pub fn encode_sub_frame(channel: SubChannel, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SUB_FRAME_HEADER_LEN + data.len());
    out.push(channel.id());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_v2_split_packets() {
        let mut bytes = encode_shell_packet(&ShellPacket::Stdout(Bytes::from_static(b"INFO: up")));
        bytes.extend(encode_shell_packet(&ShellPacket::Exit(1)));

        let mut decoder = ShellV2Decoder::new();
        decoder.extend(&bytes[..7]);
        assert_eq!(decoder.next_packet().unwrap(), None);
        decoder.extend(&bytes[7..]);
        assert_eq!(
            decoder.next_packet().unwrap(),
            Some(ShellPacket::Stdout(Bytes::from_static(b"INFO: up")))
        );
        assert_eq!(decoder.next_packet().unwrap(), Some(ShellPacket::Exit(1)));
        assert_eq!(decoder.next_packet().unwrap(), None);
    }

    #[test]
    fn test_shell_v2_unknown_id() {
        let mut decoder = ShellV2Decoder::new();
        decoder.extend(&[9, 0, 0, 0, 0]);
        assert!(decoder.next_packet().is_err());
    }

    #[test]
    fn test_sub_frames_interleaved() {
        let mut bytes = encode_sub_frame(SubChannel::Video, &[1, 2, 3]);
        bytes.extend(encode_sub_frame(SubChannel::Control, b"ok"));

        let mut decoder = SubFrameDecoder::new();
        decoder.extend(&bytes);
        let (channel, data) = decoder.next_sub_frame().unwrap().unwrap();
        assert_eq!(channel, SubChannel::Video);
        assert_eq!(&data[..], &[1, 2, 3]);
        let (channel, data) = decoder.next_sub_frame().unwrap().unwrap();
        assert_eq!(channel, SubChannel::Control);
        assert_eq!(&data[..], b"ok");
    }

    #[test]
    fn test_sub_frame_too_large() {
        let mut decoder = SubFrameDecoder::new();
        decoder.extend(&[1, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            decoder.next_sub_frame(),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
