//! Integration tests for the bridge wire format
//!
//! Exercises frame reassembly over arbitrary chunk boundaries and the
//! integrity checks that make a corrupted stream fatal.

use proptest::prelude::*;
use protocol::{
    Command, Frame, FrameDecoder, HEADER_LEN, HOST_MAX_PAYLOAD, ProtocolError, encode_frame,
};

fn concat(frames: &[Frame]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(&encode_frame(frame).expect("Failed to encode"));
    }
    out
}

fn decode_in_chunks(bytes: &[u8], cuts: &[usize]) -> Result<Vec<Frame>, ProtocolError> {
    let mut decoder = FrameDecoder::new(HOST_MAX_PAYLOAD);
    let mut frames = Vec::new();
    let mut start = 0;
    let mut boundaries: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
    boundaries.sort_unstable();
    boundaries.push(bytes.len());

    for end in boundaries {
        if end < start {
            continue;
        }
        decoder.extend(&bytes[start..end]);
        start = end;
        while let Some(frame) = decoder.next_frame()? {
            frames.push(frame);
        }
    }
    Ok(frames)
}

mod reassembly {
    use super::*;

    #[test]
    fn test_stream_of_mixed_frames() {
        let frames = vec![
            Frame::connect(0x0100_0000, 262_144, "device::features=shell_v2"),
            Frame::okay(1, 100),
            Frame::write(1, 100, b"first".to_vec()),
            Frame::write(1, 100, b"second".to_vec()),
            Frame::close(1, 100),
        ];
        let bytes = concat(&frames);

        let decoded = decode_in_chunks(&bytes, &[3, 30, 31, 70]).expect("Failed to decode");
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_max_payload_frame_accepted() {
        let frame = Frame::write(2, 3, vec![0xab; HOST_MAX_PAYLOAD]);
        let bytes = concat(std::slice::from_ref(&frame));
        let decoded = decode_in_chunks(&bytes, &[512, 16_384]).expect("Failed to decode");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].payload.len(), HOST_MAX_PAYLOAD);
    }

    proptest! {
        #[test]
        fn prop_payload_order_survives_any_chunking(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..600), 1..20),
            cuts in proptest::collection::vec(any::<usize>(), 0..40),
        ) {
            let frames: Vec<Frame> = payloads
                .iter()
                .map(|p| Frame::write(7, 9, p.clone()))
                .collect();
            let bytes = concat(&frames);

            let decoded = decode_in_chunks(&bytes, &cuts).unwrap();
            let received: Vec<Vec<u8>> = decoded.iter().map(|f| f.payload.to_vec()).collect();
            prop_assert_eq!(received, payloads);
        }
    }
}

mod integrity {
    use super::*;

    #[test]
    fn test_flipped_payload_bit_is_rejected() {
        let mut bytes = concat(&[Frame::write(1, 2, b"video bytes".to_vec())]);
        bytes[HEADER_LEN + 2] ^= 0x40;

        let result = decode_in_chunks(&bytes, &[]);
        assert!(matches!(result, Err(ProtocolError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_length_misaligns_and_is_rejected() {
        // Declare one byte fewer than the payload holds: the checksum no
        // longer matches, so the frame is never accepted.
        let mut bytes = concat(&[Frame::write(1, 2, b"abcdef".to_vec())]);
        bytes[12] = 5;

        let result = decode_in_chunks(&bytes, &[]);
        assert!(matches!(result, Err(ProtocolError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut bytes = concat(&[Frame::okay(1, 2)]);
        let bogus = 0x1234_5678u32;
        bytes[0..4].copy_from_slice(&bogus.to_le_bytes());
        bytes[20..24].copy_from_slice(&(bogus ^ 0xffff_ffff).to_le_bytes());

        let result = decode_in_chunks(&bytes, &[]);
        assert!(matches!(result, Err(ProtocolError::UnknownCommand(0x1234_5678))));
    }

    proptest! {
        #[test]
        fn prop_any_single_payload_corruption_is_detected(
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<usize>(),
            delta in 1u8..=255,
        ) {
            let frame = Frame::write(1, 2, payload.clone());
            let mut bytes = concat(&[frame]);
            let at = HEADER_LEN + index % payload.len();
            bytes[at] = bytes[at].wrapping_add(delta);

            let result = decode_in_chunks(&bytes, &[]);
            let is_mismatch = matches!(result, Err(ProtocolError::ChecksumMismatch { .. }));
            prop_assert!(is_mismatch);
        }
    }

    #[test]
    fn test_command_helpers() {
        assert_eq!(Frame::okay(1, 2).command, Command::Okay);
        assert_eq!(Frame::close(1, 2).command, Command::Clse);
    }
}
