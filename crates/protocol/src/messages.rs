//! Bridge protocol frame definitions
//!
//! Every frame is a fixed 24-byte little-endian header followed by an
//! optional payload:
//!
//! ```text
//! [command u32][arg0 u32][arg1 u32][payload_len u32][checksum u32][magic u32][payload...]
//! ```
//!
//! `magic` is `command ^ 0xffffffff` and `checksum` is the byte sum of the
//! payload (see [`crate::integrity`]).

use crate::integrity::compute_checksum;
use crate::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

/// Size of the frame header in bytes
pub const HEADER_LEN: usize = 24;

/// Bridge protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Legacy synchronisation frame, never sent by current devices
    Sync = 0x434e_5953,
    /// Connection handshake
    Cnxn = 0x4e58_4e43,
    /// Authentication challenge or response
    Auth = 0x4854_5541,
    /// Open a logical stream
    Open = 0x4e45_504f,
    /// Stream ready / write acknowledged
    Okay = 0x5941_4b4f,
    /// Close a logical stream
    Clse = 0x4553_4c43,
    /// Stream data
    Wrte = 0x4554_5257,
    /// TLS upgrade request (not supported over USB)
    Stls = 0x534c_5453,
}

impl Command {
    /// Raw command word
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Magic word that must accompany this command
    pub fn magic(self) -> u32 {
        self.as_u32() ^ 0xffff_ffff
    }

    /// Four-letter mnemonic, used in logs
    pub fn name(self) -> &'static str {
        match self {
            Command::Sync => "SYNC",
            Command::Cnxn => "CNXN",
            Command::Auth => "AUTH",
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Clse => "CLSE",
            Command::Wrte => "WRTE",
            Command::Stls => "STLS",
        }
    }
}

impl TryFrom<u32> for Command {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0x434e_5953 => Command::Sync,
            0x4e58_4e43 => Command::Cnxn,
            0x4854_5541 => Command::Auth,
            0x4e45_504f => Command::Open,
            0x5941_4b4f => Command::Okay,
            0x4553_4c43 => Command::Clse,
            0x4554_5257 => Command::Wrte,
            0x534c_5453 => Command::Stls,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// AUTH frame sub-types (carried in `arg0`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    /// Device challenge: payload is a random token to sign
    Token = 1,
    /// Host response: payload is the token signature
    Signature = 2,
    /// Host response: payload is the public key for user approval
    RsaPublicKey = 3,
}

impl TryFrom<u32> for AuthType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(AuthType::Token),
            2 => Ok(AuthType::Signature),
            3 => Ok(AuthType::RsaPublicKey),
            other => Err(ProtocolError::malformed(
                "AUTH frame",
                format!("unknown auth type {}", other),
            )),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload_len: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// Parse and validate a header (command word and magic)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::IncompleteFrame {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let raw_command = LittleEndian::read_u32(&bytes[0..4]);
        let magic = LittleEndian::read_u32(&bytes[20..24]);
        if magic != raw_command ^ 0xffff_ffff {
            return Err(ProtocolError::InvalidMagic {
                command: raw_command,
                magic,
            });
        }

        Ok(Self {
            command: Command::try_from(raw_command)?,
            arg0: LittleEndian::read_u32(&bytes[4..8]),
            arg1: LittleEndian::read_u32(&bytes[8..12]),
            payload_len: LittleEndian::read_u32(&bytes[12..16]),
            checksum: LittleEndian::read_u32(&bytes[16..20]),
        })
    }

    /// Serialize the header into its 24-byte wire form
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut out[0..4], self.command.as_u32());
        LittleEndian::write_u32(&mut out[4..8], self.arg0);
        LittleEndian::write_u32(&mut out[8..12], self.arg1);
        LittleEndian::write_u32(&mut out[12..16], self.payload_len);
        LittleEndian::write_u32(&mut out[16..20], self.checksum);
        LittleEndian::write_u32(&mut out[20..24], self.command.magic());
        out
    }
}

/// A complete bridge frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame with the given payload
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    /// CNXN(version, max_payload, banner)
    pub fn connect(version: u32, max_payload: u32, banner: &str) -> Self {
        Self::new(Command::Cnxn, version, max_payload, null_terminated(banner))
    }

    /// AUTH(type, 0, payload)
    pub fn auth(auth_type: AuthType, payload: impl Into<Bytes>) -> Self {
        Self::new(Command::Auth, auth_type as u32, 0, payload)
    }

    /// OPEN(local_id, 0, destination)
    pub fn open(local_id: u32, destination: &str) -> Self {
        Self::new(Command::Open, local_id, 0, null_terminated(destination))
    }

    /// OKAY(local_id, remote_id)
    pub fn okay(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Okay, local_id, remote_id, Bytes::new())
    }

    /// WRTE(local_id, remote_id, data)
    pub fn write(local_id: u32, remote_id: u32, data: impl Into<Bytes>) -> Self {
        Self::new(Command::Wrte, local_id, remote_id, data)
    }

    /// CLSE(local_id, remote_id)
    pub fn close(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Clse, local_id, remote_id, Bytes::new())
    }

    /// Header describing this frame, with checksum computed over the payload
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            command: self.command,
            arg0: self.arg0,
            arg1: self.arg1,
            payload_len: self.payload.len() as u32,
            checksum: compute_checksum(&self.payload),
        }
    }

    /// Payload interpreted as a NUL-terminated string
    pub fn payload_str(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({:#x}, {:#x}, {} bytes)",
            self.command,
            self.arg0,
            self.arg1,
            self.payload.len()
        )
    }
}

fn null_terminated(s: &str) -> Bytes {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    Bytes::from(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_words_spell_mnemonics() {
        for command in [
            Command::Sync,
            Command::Cnxn,
            Command::Auth,
            Command::Open,
            Command::Okay,
            Command::Clse,
            Command::Wrte,
            Command::Stls,
        ] {
            let word = command.as_u32().to_le_bytes();
            assert_eq!(std::str::from_utf8(&word).unwrap(), command.name());
            assert_eq!(Command::try_from(command.as_u32()).unwrap(), command);
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let frame = Frame::open(7, "shell:ls");
        let header = frame.header();
        let parsed = FrameHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.payload_len, 9);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = Frame::okay(1, 2).header().to_bytes();
        bytes[20] ^= 0xff;
        assert!(matches!(
            FrameHeader::parse(&bytes),
            Err(ProtocolError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_payload_str_stops_at_nul() {
        let frame = Frame::connect(0x0100_0000, 4096, "device::features=shell_v2");
        assert_eq!(frame.payload_str(), "device::features=shell_v2");
        assert_eq!(frame.payload.last(), Some(&0));
    }
}
