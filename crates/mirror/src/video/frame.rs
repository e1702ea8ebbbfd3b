//! Units flowing through the video pipeline

use bytes::Bytes;
use std::sync::Arc;

/// One compressed access unit, ready for the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Position in the stream, starting at 0
    pub index: u64,
    /// Presentation timestamp in microseconds
    pub pts: Option<u64>,
    pub keyframe: bool,
    pub data: Bytes,
}

/// A decoded RGBA8 picture
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGBA8, `width * height * 4` bytes
    pub pixels: Vec<u8>,
    /// Presentation timestamp of the source unit, in microseconds
    pub timestamp: Option<u64>,
    /// Index of the access unit this frame came from
    pub index: u64,
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixels", &self.pixels.len())
            .field("timestamp", &self.timestamp)
            .field("index", &self.index)
            .finish()
    }
}

/// Surface callback receiving each presented frame
pub type DrawCallback = Arc<dyn Fn(&DecodedFrame) + Send + Sync>;
