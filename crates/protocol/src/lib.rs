//! Wire protocol for the USB mirroring bridge
//!
//! This crate defines the framed, multiplexed device-bridge protocol spoken
//! over the USB bulk endpoints, plus the record formats produced by the
//! remote capture service once it is running. It performs no I/O of its
//! own; connection state lives in the `mirror` crate.
//!
//! # Example
//!
//! ```
//! use protocol::{Command, Frame, FrameDecoder, HOST_MAX_PAYLOAD, encode_frame};
//!
//! // Encode an OPEN request
//! let frame = Frame::open(1, "shell:echo hi");
//! let bytes = encode_frame(&frame).unwrap();
//!
//! // Reassemble it from the byte stream
//! let mut decoder = FrameDecoder::new(HOST_MAX_PAYLOAD);
//! decoder.extend(&bytes);
//! let decoded = decoder.next_frame().unwrap().unwrap();
//! assert_eq!(decoded.command, Command::Open);
//! assert_eq!(decoded.payload_str(), "shell:echo hi");
//! ```

pub mod capture;
pub mod codec;
pub mod error;
pub mod integrity;
pub mod messages;
pub mod shell;
pub mod sync;
pub mod types;
pub mod version;

pub use capture::{CodecMeta, DeviceMessage, PacketHeader, VideoCodec};
pub use codec::{FrameDecoder, decode_frame, encode_frame};
pub use error::{ProtocolError, Result};
pub use messages::{AuthType, Command, Frame, FrameHeader, HEADER_LEN};
pub use shell::{ShellPacket, ShellV2Decoder, SubChannel, SubFrameDecoder};
pub use types::{DeviceBanner, LocalId, RemoteId};
pub use version::{ConnectionParams, HOST_MAX_PAYLOAD, HOST_VERSION, host_banner};
