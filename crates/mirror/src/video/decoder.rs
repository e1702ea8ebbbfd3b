//! Decoder abstraction
//!
//! The pipeline only sees [`VideoDecoder`]; concrete decoders are created
//! per session by a [`DecoderFactory`] once the codec is known.

use crate::capture::VideoMeta;
use crate::video::frame::{AccessUnit, DecodedFrame};
use common::MirrorError;
use std::sync::Arc;

/// Turns access units into RGBA frames, in submission order
///
/// Errors must be `MirrorError::DecodeError` for a unit that could not be
/// decoded; the pipeline skips such units. Any other error is fatal.
pub trait VideoDecoder: Send {
    fn decode(&mut self, unit: &AccessUnit) -> Result<Vec<DecodedFrame>, MirrorError>;

    /// Frames still buffered inside the decoder at end of stream
    fn flush(&mut self) -> Result<Vec<DecodedFrame>, MirrorError> {
        Ok(Vec::new())
    }
}

/// Builds a decoder for the announced stream
pub type DecoderFactory =
    Arc<dyn Fn(&VideoMeta) -> Result<Box<dyn VideoDecoder>, MirrorError> + Send + Sync>;

/// Factory for the decoders compiled into this build
pub fn default_decoder_factory() -> DecoderFactory {
    Arc::new(|meta: &VideoMeta| -> Result<Box<dyn VideoDecoder>, MirrorError> {
        match meta.codec {
            #[cfg(feature = "h264")]
            protocol::VideoCodec::H264 => Ok(Box::new(h264::H264Decoder::new()?)),
            other => Err(MirrorError::UnsupportedCodec(format!(
                "no decoder for {} in this build",
                other
            ))),
        }
    })
}

#[cfg(feature = "h264")]
pub use h264::H264Decoder;

#[cfg(feature = "h264")]
mod h264 {
    use super::VideoDecoder;
    use crate::video::frame::{AccessUnit, DecodedFrame};
    use common::MirrorError;
    use openh264::decoder::Decoder;
    use openh264::formats::YUVSource;
    use tracing::debug;

    /// Software H.264 decoder backed by OpenH264
    pub struct H264Decoder {
        inner: Decoder,
    }

    impl H264Decoder {
        pub fn new() -> Result<Self, MirrorError> {
            let inner = Decoder::new().map_err(|e| {
                MirrorError::PipelineFailure(format!("Failed to create H.264 decoder: {}", e))
            })?;
            Ok(Self { inner })
        }
    }

    impl VideoDecoder for H264Decoder {
        fn decode(&mut self, unit: &AccessUnit) -> Result<Vec<DecodedFrame>, MirrorError> {
            let mut frames = Vec::new();
            for nal in openh264::nal_units(&unit.data) {
                let picture = self.inner.decode(nal).map_err(|e| {
                    MirrorError::DecodeError(format!("unit {}: {}", unit.index, e))
                })?;
                let Some(yuv) = picture else {
                    continue;
                };

                let (width, height) = yuv.dimensions();
                let mut pixels = vec![0u8; width * height * 4];
                yuv.write_rgba8(&mut pixels);
                frames.push(DecodedFrame {
                    width: width as u32,
                    height: height as u32,
                    pixels,
                    timestamp: unit.pts,
                    index: unit.index,
                });
            }
            if frames.is_empty() {
                debug!("Unit {} produced no picture", unit.index);
            }
            Ok(frames)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::VideoCodec;

    fn meta(codec: VideoCodec) -> VideoMeta {
        VideoMeta {
            device_name: "Pixel 7".to_string(),
            codec,
            width: 1080,
            height: 2400,
            framed: true,
        }
    }

    #[test]
    fn test_codec_without_decoder_is_unsupported() {
        let factory = default_decoder_factory();
        let err = factory(&meta(VideoCodec::Av1)).err().unwrap();
        assert_eq!(err.kind(), "unsupported_codec");
        assert!(err.to_string().contains("av1"));
    }

    #[cfg(not(feature = "h264"))]
    #[test]
    fn test_h264_needs_feature() {
        let factory = default_decoder_factory();
        let err = factory(&meta(VideoCodec::H264)).err().unwrap();
        assert_eq!(
            err,
            MirrorError::UnsupportedCodec("no decoder for h264 in this build".into())
        );
    }
}
