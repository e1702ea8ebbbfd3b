//! Splits the video byte stream into access units
//!
//! Two framings are supported:
//!
//! - `Framed`: each packet is preceded by a 12-byte [`PacketHeader`];
//!   codec configuration packets are prepended to the next unit.
//! - `AnnexB`: raw H.264 with start codes. A unit ends when the next one
//!   begins: an AUD, a parameter set or SEI after a slice, or a slice whose
//!   `first_mb_in_slice` is 0. The last unit is flushed by [`finish`].
//!
//! [`finish`]: AccessUnitDemuxer::finish

use crate::video::frame::AccessUnit;
use bytes::{Buf, Bytes, BytesMut};
use common::MirrorError;
use protocol::PacketHeader;
use protocol::capture::PACKET_HEADER_LEN;
use tracing::debug;

/// Largest access unit accepted
pub const MAX_UNIT_SIZE: usize = 8 * 1024 * 1024;

const NAL_SLICE: u8 = 1;
const NAL_IDR: u8 = 5;
const NAL_SEI: u8 = 6;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_AUD: u8 = 9;

/// Byte-stream framing of the video channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxMode {
    Framed,
    AnnexB,
}

/// Incremental access-unit splitter
#[derive(Debug)]
pub struct AccessUnitDemuxer {
    mode: DemuxMode,
    buffer: BytesMut,
    max_unit: usize,
    next_index: u64,
    // Framed
    header: Option<PacketHeader>,
    config: BytesMut,
    // Annex B
    scan_from: usize,
    unit: BytesMut,
    unit_has_slice: bool,
    unit_keyframe: bool,
}

impl AccessUnitDemuxer {
    pub fn new(mode: DemuxMode) -> Self {
        Self::with_max_unit(mode, MAX_UNIT_SIZE)
    }

    pub fn with_max_unit(mode: DemuxMode, max_unit: usize) -> Self {
        Self {
            mode,
            buffer: BytesMut::new(),
            max_unit,
            next_index: 0,
            header: None,
            config: BytesMut::new(),
            scan_from: 0,
            unit: BytesMut::new(),
            unit_has_slice: false,
            unit_keyframe: false,
        }
    }

    pub fn mode(&self) -> DemuxMode {
        self.mode
    }

    /// Feed bytes, returning every unit they complete
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<AccessUnit>, MirrorError> {
        self.buffer.extend_from_slice(data);
        let mut units = Vec::new();
        match self.mode {
            DemuxMode::Framed => self.split_framed(&mut units)?,
            DemuxMode::AnnexB => self.split_annex_b(&mut units)?,
        }
        Ok(units)
    }

    /// End of stream: flush what can still form a unit
    pub fn finish(&mut self) -> Vec<AccessUnit> {
        let mut units = Vec::new();
        match self.mode {
            DemuxMode::Framed => {
                if !self.buffer.is_empty() || self.header.is_some() {
                    debug!("Discarding {} bytes of a truncated packet", self.buffer.len());
                }
                self.header = None;
            }
            DemuxMode::AnnexB => {
                if find_start_code(&self.buffer, 0, 0).is_some() {
                    let nal = self.buffer.split().freeze();
                    units.extend(self.on_nal(nal));
                }
                units.extend(self.take_unit());
            }
        }
        self.buffer.clear();
        units
    }

    fn split_framed(&mut self, units: &mut Vec<AccessUnit>) -> Result<(), MirrorError> {
        loop {
            let header = match self.header {
                Some(header) => header,
                None => {
                    if self.buffer.len() < PACKET_HEADER_LEN {
                        return Ok(());
                    }
                    let header = PacketHeader::parse(&self.buffer[..PACKET_HEADER_LEN])?;
                    self.buffer.advance(PACKET_HEADER_LEN);
                    if header.size as usize > self.max_unit {
                        return Err(MirrorError::ProtocolViolation(format!(
                            "video packet of {} bytes exceeds {}",
                            header.size, self.max_unit
                        )));
                    }
                    self.header = Some(header);
                    header
                }
            };

            let size = header.size as usize;
            if self.buffer.len() < size {
                return Ok(());
            }
            self.header = None;
            let packet = self.buffer.split_to(size);

            if header.config {
                debug!("Codec configuration packet ({} bytes)", size);
                self.config.extend_from_slice(&packet);
                continue;
            }

            let data = if self.config.is_empty() {
                packet.freeze()
            } else {
                let mut merged = self.config.split();
                merged.extend_from_slice(&packet);
                merged.freeze()
            };
            units.push(AccessUnit {
                index: self.allocate_index(),
                pts: header.pts,
                keyframe: header.key_frame,
                data,
            });
        }
    }

    fn split_annex_b(&mut self, units: &mut Vec<AccessUnit>) -> Result<(), MirrorError> {
        loop {
            let Some((first, first_len)) = find_start_code(&self.buffer, 0, 0) else {
                // Keep a possible partial start code
                let keep = self.buffer.len().min(3);
                self.buffer.advance(self.buffer.len() - keep);
                return Ok(());
            };
            if first > 0 {
                debug!("Skipping {} bytes before the first start code", first);
                self.buffer.advance(first);
                self.scan_from = 0;
                continue;
            }

            let from = self.scan_from.max(first_len);
            let Some((next, _)) = find_start_code(&self.buffer, from, first_len) else {
                if self.buffer.len() > self.max_unit {
                    return Err(MirrorError::ProtocolViolation(format!(
                        "NAL unit exceeds {} bytes",
                        self.max_unit
                    )));
                }
                self.scan_from = self.buffer.len().saturating_sub(3);
                return Ok(());
            };

            self.scan_from = 0;
            let nal = self.buffer.split_to(next).freeze();
            if let Some(unit) = self.on_nal(nal) {
                units.push(unit);
            }
            if self.unit.len() > self.max_unit {
                return Err(MirrorError::ProtocolViolation(format!(
                    "access unit exceeds {} bytes",
                    self.max_unit
                )));
            }
        }
    }

    /// Add one NAL (with its start code) to the current unit
    ///
    /// Returns the previous unit when this NAL begins a new one.
    fn on_nal(&mut self, nal: Bytes) -> Option<AccessUnit> {
        let header_at = if nal.get(2) == Some(&1) { 3 } else { 4 };
        let Some(&header) = nal.get(header_at) else {
            return None;
        };
        let nal_type = header & 0x1f;
        let is_slice = nal_type == NAL_SLICE || nal_type == NAL_IDR;
        // first_mb_in_slice is ue(v); a leading 1 bit encodes 0
        let first_mb_zero = nal.get(header_at + 1).is_some_and(|b| b & 0x80 != 0);

        let starts_unit = self.unit_has_slice
            && (matches!(nal_type, NAL_AUD | NAL_SEI | NAL_SPS | NAL_PPS)
                || (is_slice && first_mb_zero));
        let finished = if starts_unit { self.take_unit() } else { None };

        self.unit.extend_from_slice(&nal);
        if is_slice {
            self.unit_has_slice = true;
        }
        if nal_type == NAL_IDR {
            self.unit_keyframe = true;
        }
        finished
    }

    fn take_unit(&mut self) -> Option<AccessUnit> {
        if self.unit.is_empty() {
            return None;
        }
        let keyframe = self.unit_keyframe;
        self.unit_has_slice = false;
        self.unit_keyframe = false;
        let data = self.unit.split().freeze();
        Some(AccessUnit {
            index: self.allocate_index(),
            pts: None,
            keyframe,
            data,
        })
    }

    fn allocate_index(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

/// Position and length of the first start code at or after `from`
///
/// A 4-byte code is reported when its leading zero lies at or after `floor`.
fn find_start_code(data: &[u8], from: usize, floor: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if i > floor && data[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed_packet(pts: Option<u64>, config: bool, key_frame: bool, data: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            pts,
            config,
            key_frame,
            size: data.len() as u32,
        };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_framed_merges_config_into_next_unit() {
        let mut stream = framed_packet(None, true, false, b"SPSPPS");
        stream.extend(framed_packet(Some(0), false, true, b"IDR"));
        stream.extend(framed_packet(Some(16_666), false, false, b"P1"));

        let mut demux = AccessUnitDemuxer::new(DemuxMode::Framed);
        let units = demux.push(&stream).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0].data[..], b"SPSPPSIDR");
        assert!(units[0].keyframe);
        assert_eq!(units[0].index, 0);
        assert_eq!(units[1].pts, Some(16_666));
        assert_eq!(units[1].index, 1);
    }

    #[test]
    fn test_framed_partial_reads() {
        let stream = framed_packet(Some(5), false, false, b"0123456789");
        let mut demux = AccessUnitDemuxer::new(DemuxMode::Framed);
        let mut units = Vec::new();
        for byte in &stream {
            units.extend(demux.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].data[..], b"0123456789");
        assert!(demux.finish().is_empty());
    }

    #[test]
    fn test_framed_rejects_oversized_packet() {
        let stream = framed_packet(Some(0), false, false, &[0u8; 64]);
        let mut demux = AccessUnitDemuxer::with_max_unit(DemuxMode::Framed, 32);
        assert!(matches!(
            demux.push(&stream),
            Err(MirrorError::ProtocolViolation(_))
        ));
    }

    // SPS, PPS, IDR (first_mb 0), P slice (first_mb 0), P slice (first_mb != 0)
    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80];
    const IDR: &[u8] = &[0, 0, 1, 0x65, 0x88, 0x84, 0x00];
    const P_START: &[u8] = &[0, 0, 0, 1, 0x41, 0x9a, 0x02];
    const P_CONT: &[u8] = &[0, 0, 1, 0x41, 0x40, 0x11];

    #[test]
    fn test_annex_b_unit_boundaries() {
        let stream = [SPS, PPS, IDR, P_START, P_CONT].concat();
        let mut demux = AccessUnitDemuxer::new(DemuxMode::AnnexB);
        let units = demux.push(&stream).unwrap();

        // The first unit completes once the next slice with first_mb 0 appears
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].data[..], [SPS, PPS, IDR].concat().as_slice());
        assert!(units[0].keyframe);

        let rest = demux.finish();
        assert_eq!(rest.len(), 1);
        let last = &rest[0];
        assert_eq!(&last.data[..], [P_START, P_CONT].concat().as_slice());
        assert!(!last.keyframe);
        assert_eq!(last.index, 1);
    }

    #[test]
    fn test_annex_b_split_start_code() {
        let stream = [IDR, P_START, SPS].concat();
        let mut demux = AccessUnitDemuxer::new(DemuxMode::AnnexB);
        let mut units = Vec::new();
        for chunk in stream.chunks(2) {
            units.extend(demux.push(chunk).unwrap());
        }
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].data[..], IDR);

        // The trailing SPS closes the P unit and forms its own
        let rest = demux.finish();
        assert_eq!(rest.len(), 2);
        assert_eq!(&rest[0].data[..], P_START);
        assert_eq!(&rest[1].data[..], SPS);
        assert_eq!(rest[1].index, 2);
    }

    #[test]
    fn test_annex_b_skips_leading_garbage() {
        let stream = [&[0xff, 0xee][..], IDR].concat();
        let mut demux = AccessUnitDemuxer::new(DemuxMode::AnnexB);
        assert!(demux.push(&stream).unwrap().is_empty());
        let rest = demux.finish();
        assert_eq!(rest.len(), 1);
        assert_eq!(&rest[0].data[..], IDR);
    }
}
