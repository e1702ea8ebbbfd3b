//! Frame encoding and streaming reassembly
//!
//! The transport delivers an undifferentiated byte stream: a single read may
//! contain half a header, several frames, or a frame split across many bulk
//! transfers. [`FrameDecoder`] buffers incoming bytes and yields complete,
//! validated frames in receipt order.
//!
//! # Example
//!
//! ```
//! use protocol::{Frame, FrameDecoder, encode_frame, HOST_MAX_PAYLOAD};
//!
//! let bytes = encode_frame(&Frame::okay(1, 2)).unwrap();
//!
//! let mut decoder = FrameDecoder::new(HOST_MAX_PAYLOAD);
//! decoder.extend(&bytes[..10]);
//! assert!(decoder.next_frame().unwrap().is_none());
//! decoder.extend(&bytes[10..]);
//! assert_eq!(decoder.next_frame().unwrap(), Some(Frame::okay(1, 2)));
//! ```

use crate::integrity::compute_checksum;
use crate::messages::{Frame, FrameHeader, HEADER_LEN};
use crate::{ProtocolError, Result};
use bytes::{Buf, Bytes, BytesMut};

/// Encode a frame into header + payload bytes
///
/// Fails if the payload does not fit in the 32-bit length field.
pub fn encode_frame(frame: &Frame) -> Result<Bytes> {
    if frame.payload.len() > u32::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge {
            size: frame.payload.len(),
            max: u32::MAX as usize,
        });
    }

    let mut out = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
    out.extend_from_slice(&frame.header().to_bytes());
    out.extend_from_slice(&frame.payload);
    Ok(out.freeze())
}

/// Decode exactly one frame from a complete buffer
pub fn decode_frame(bytes: &[u8], max_payload: usize) -> Result<Frame> {
    let mut decoder = FrameDecoder::new(max_payload);
    decoder.extend(bytes);
    match decoder.next_frame()? {
        Some(frame) => Ok(frame),
        None => {
            let expected = FrameHeader::parse(bytes)
                .map(|h| HEADER_LEN + h.payload_len as usize)
                .unwrap_or(HEADER_LEN);
            Err(ProtocolError::IncompleteFrame {
                expected,
                actual: bytes.len(),
            })
        }
    }
}

fn check_length(header: &FrameHeader, max_payload: usize) -> Result<()> {
    let len = header.payload_len as usize;
    if len > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }
    Ok(())
}

fn check_payload(header: &FrameHeader, payload: &[u8]) -> Result<()> {
    let computed = compute_checksum(payload);
    if computed != header.checksum {
        return Err(ProtocolError::ChecksumMismatch {
            expected: header.checksum,
            computed,
        });
    }
    Ok(())
}

/// Incremental frame reassembler
///
/// Once `next_frame` returns an error the decoder is poisoned: the byte
/// stream can no longer be trusted to be aligned on frame boundaries.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    header: Option<FrameHeader>,
    max_payload: usize,
    poisoned: bool,
}

impl FrameDecoder {
    /// Create a decoder accepting payloads up to `max_payload` bytes
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(HEADER_LEN + max_payload.min(64 * 1024)),
            header: None,
            max_payload,
            poisoned: false,
        }
    }

    /// Change the payload limit (after CNXN negotiation)
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Append bytes read from the transport
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as frames
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.poisoned {
            return Err(ProtocolError::malformed(
                "frame stream",
                "decoder poisoned by an earlier error",
            ));
        }

        let result = self.try_next();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn try_next(&mut self) -> Result<Option<Frame>> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if self.buffer.len() < HEADER_LEN {
                    return Ok(None);
                }
                let header = FrameHeader::parse(&self.buffer[..HEADER_LEN])?;
                check_length(&header, self.max_payload)?;
                self.buffer.advance(HEADER_LEN);
                self.header = Some(header);
                header
            }
        };

        let len = header.payload_len as usize;
        if self.buffer.len() < len {
            return Ok(None);
        }

        let payload = self.buffer.split_to(len).freeze();
        self.header = None;
        check_payload(&header, &payload)?;

        Ok(Some(Frame {
            command: header.command,
            arg0: header.arg0,
            arg1: header.arg1,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::HOST_MAX_PAYLOAD;

    #[test]
    fn test_encode_decode() {
        let frame = Frame::write(3, 9, b"hello".to_vec());
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 5);

        let decoded = decode_frame(&bytes, HOST_MAX_PAYLOAD).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decoder_handles_byte_at_a_time() {
        let frames = vec![
            Frame::connect(0x0100_0000, 4096, "device::features=cmd"),
            Frame::okay(1, 2),
            Frame::write(1, 2, vec![7u8; 300]),
        ];
        let mut stream = Vec::new();
        for frame in &frames {
            stream.extend_from_slice(&encode_frame(frame).unwrap());
        }

        let mut decoder = FrameDecoder::new(HOST_MAX_PAYLOAD);
        let mut decoded = Vec::new();
        for byte in stream {
            decoder.extend(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded, frames);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_rejects_checksum_mismatch() {
        let mut bytes = encode_frame(&Frame::write(1, 2, b"abc".to_vec()))
            .unwrap()
            .to_vec();
        let last = bytes.len() - 1;
        bytes[last] = b'd';

        let mut decoder = FrameDecoder::new(HOST_MAX_PAYLOAD);
        decoder.extend(&bytes);
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
        // Poisoned from now on
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_decoder_rejects_oversized_payload() {
        let frame = Frame::write(1, 2, vec![0u8; 5000]);
        let bytes = encode_frame(&frame).unwrap();

        let mut decoder = FrameDecoder::new(4096);
        decoder.extend(&bytes[..HEADER_LEN]);
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::PayloadTooLarge { size: 5000, max: 4096 })
        ));
    }

    #[test]
    fn test_decode_incomplete_frame() {
        let bytes = encode_frame(&Frame::write(1, 2, vec![1u8; 10])).unwrap();
        let result = decode_frame(&bytes[..HEADER_LEN + 4], HOST_MAX_PAYLOAD);
        let Err(ProtocolError::IncompleteFrame { expected, actual }) = result else {
            panic!("Expected IncompleteFrame error, got {:?}", result);
        };
        assert_eq!(expected, HEADER_LEN + 10);
        assert_eq!(actual, HEADER_LEN + 4);
    }

    #[test]
    fn test_empty_payload_frame() {
        let bytes = encode_frame(&Frame::close(4, 8)).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = decode_frame(&bytes, HOST_MAX_PAYLOAD).unwrap();
        assert!(decoded.payload.is_empty());
    }
}
