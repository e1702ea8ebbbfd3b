//! Capture-service wire formats
//!
//! Once the remote capture service is running, the video stream starts with
//! a fixed preamble followed by length-prefixed packets:
//!
//! ```text
//! [dummy byte]          (forward tunnels only)
//! [device name: 64 bytes, NUL padded]
//! [codec id: u32 BE][width: u32 BE][height: u32 BE]
//! repeat:
//!   [pts_and_flags: u64 BE][size: u32 BE][packet bytes...]
//! ```
//!
//! Bit 63 of `pts_and_flags` marks a codec configuration packet (SPS/PPS),
//! bit 62 marks a key frame.

use crate::{ProtocolError, Result};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

/// Length of the NUL-padded device name in the video preamble
pub const DEVICE_NAME_LEN: usize = 64;

/// Length of the codec metadata record
pub const CODEC_META_LEN: usize = 12;

/// Length of a video packet header
pub const PACKET_HEADER_LEN: usize = 12;

const FLAG_CONFIG: u64 = 1 << 63;
const FLAG_KEY_FRAME: u64 = 1 << 62;
const PTS_MASK: u64 = FLAG_KEY_FRAME - 1;

/// Video codecs the capture service can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
    Av1,
}

impl VideoCodec {
    /// Codec id as sent in the codec metadata record
    pub fn id(self) -> u32 {
        match self {
            VideoCodec::H264 => 0x6832_3634,
            VideoCodec::H265 => 0x6832_3635,
            VideoCodec::Av1 => 0x0061_7631,
        }
    }

    /// Name used on the service command line
    pub fn name(self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Av1 => "av1",
        }
    }

    /// Look a codec up by its metadata id
    pub fn from_id(id: u32) -> Option<Self> {
        [VideoCodec::H264, VideoCodec::H265, VideoCodec::Av1]
            .into_iter()
            .find(|c| c.id() == id)
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Device name from the video preamble
pub fn parse_device_name(bytes: &[u8]) -> Result<String> {
    if bytes.len() < DEVICE_NAME_LEN {
        return Err(ProtocolError::IncompleteFrame {
            expected: DEVICE_NAME_LEN,
            actual: bytes.len(),
        });
    }
    let raw = &bytes[..DEVICE_NAME_LEN];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(DEVICE_NAME_LEN);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

/// Codec metadata announced before the first video packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecMeta {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
}

impl CodecMeta {
    /// Parse the 12-byte codec metadata record
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CODEC_META_LEN {
            return Err(ProtocolError::IncompleteFrame {
                expected: CODEC_META_LEN,
                actual: bytes.len(),
            });
        }
        let id = BigEndian::read_u32(&bytes[0..4]);
        let codec = VideoCodec::from_id(id).ok_or_else(|| {
            ProtocolError::malformed("codec metadata", format!("unknown codec id {:#010x}", id))
        })?;

        Ok(Self {
            codec,
            width: BigEndian::read_u32(&bytes[4..8]),
            height: BigEndian::read_u32(&bytes[8..12]),
        })
    }

    /// Serialize the record (used by test peers)
    pub fn to_bytes(&self) -> [u8; CODEC_META_LEN] {
        let mut out = [0u8; CODEC_META_LEN];
        BigEndian::write_u32(&mut out[0..4], self.codec.id());
        BigEndian::write_u32(&mut out[4..8], self.width);
        BigEndian::write_u32(&mut out[8..12], self.height);
        out
    }
}

/// Header preceding each video packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Presentation timestamp in microseconds (absent for config packets)
    pub pts: Option<u64>,
    /// Codec configuration (parameter sets), to be merged with the next packet
    pub config: bool,
    pub key_frame: bool,
    /// Length of the packet that follows
    pub size: u32,
}

impl PacketHeader {
    /// Parse a 12-byte packet header
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKET_HEADER_LEN {
            return Err(ProtocolError::IncompleteFrame {
                expected: PACKET_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let pts_and_flags = BigEndian::read_u64(&bytes[0..8]);
        let size = BigEndian::read_u32(&bytes[8..12]);
        let config = pts_and_flags & FLAG_CONFIG != 0;

        Ok(Self {
            pts: (!config).then_some(pts_and_flags & PTS_MASK),
            config,
            key_frame: pts_and_flags & FLAG_KEY_FRAME != 0,
            size,
        })
    }

    /// Serialize the header (used by test peers)
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut pts_and_flags = self.pts.unwrap_or(0) & PTS_MASK;
        if self.config {
            pts_and_flags |= FLAG_CONFIG;
        }
        if self.key_frame {
            pts_and_flags |= FLAG_KEY_FRAME;
        }
        let mut out = [0u8; PACKET_HEADER_LEN];
        BigEndian::write_u64(&mut out[0..8], pts_and_flags);
        BigEndian::write_u32(&mut out[8..12], self.size);
        out
    }
}

/// Messages the capture service sends on its control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// Device clipboard changed
    Clipboard { text: String },
    /// Acknowledgement of a host clipboard update
    AckClipboard { sequence: u64 },
    /// Output report from a virtual HID device
    UhidOutput { id: u16, data: Vec<u8> },
}

impl DeviceMessage {
    /// Try to parse one message from the front of `bytes`
    ///
    /// Returns the message and the number of bytes consumed, or `None` when
    /// more data is needed.
    pub fn parse(bytes: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(&kind) = bytes.first() else {
            return Ok(None);
        };
        match kind {
            0 => {
                if bytes.len() < 5 {
                    return Ok(None);
                }
                let len = BigEndian::read_u32(&bytes[1..5]) as usize;
                if bytes.len() < 5 + len {
                    return Ok(None);
                }
                let text = String::from_utf8_lossy(&bytes[5..5 + len]).into_owned();
                Ok(Some((DeviceMessage::Clipboard { text }, 5 + len)))
            }
            1 => {
                if bytes.len() < 9 {
                    return Ok(None);
                }
                let sequence = BigEndian::read_u64(&bytes[1..9]);
                Ok(Some((DeviceMessage::AckClipboard { sequence }, 9)))
            }
            2 => {
                if bytes.len() < 5 {
                    return Ok(None);
                }
                let id = BigEndian::read_u16(&bytes[1..3]);
                let len = BigEndian::read_u16(&bytes[3..5]) as usize;
                if bytes.len() < 5 + len {
                    return Ok(None);
                }
                let data = bytes[5..5 + len].to_vec();
                Ok(Some((DeviceMessage::UhidOutput { id, data }, 5 + len)))
            }
            other => Err(ProtocolError::malformed(
                "device message",
                format!("unknown type {}", other),
            )),
        }
    }
}
