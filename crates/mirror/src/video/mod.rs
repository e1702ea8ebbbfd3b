//! Video pipeline: access-unit demux, decoding and presentation

pub mod decoder;
pub mod demux;
pub mod frame;
pub mod pipeline;
pub mod presenter;

#[cfg(feature = "h264")]
pub use decoder::H264Decoder;
pub use decoder::{DecoderFactory, VideoDecoder, default_decoder_factory};
pub use demux::{AccessUnitDemuxer, DemuxMode};
pub use frame::{AccessUnit, DecodedFrame, DrawCallback};
pub use pipeline::{
    PipelineConfig, PipelineState, PipelineStats, StatsSnapshot, VideoPipeline, terminal_state,
};
pub use presenter::LatestFrame;
