//! Demux, decode and present stages
//!
//! ```text
//! video channel -> [demux task] -> bounded queue -> [video-decode thread]
//!               -> LatestFrame -> [frame-presenter thread] -> draw callback
//! ```
//!
//! Demux and decode keep their order; presentation drops stale frames
//! instead of slowing the decoder down.

use crate::capture::{TunnelReader, VideoMeta};
use crate::video::decoder::VideoDecoder;
use crate::video::demux::{AccessUnitDemuxer, DemuxMode};
use crate::video::frame::{AccessUnit, DecodedFrame, DrawCallback};
use crate::video::presenter::{LatestFrame, spawn_presenter};
use common::MirrorError;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time `stop` waits for each pipeline thread to exit
const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pipeline tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Access units buffered between demux and decode
    pub unit_queue_depth: usize,
    /// Consecutive decode failures that end the pipeline
    pub max_consecutive_decode_errors: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            unit_queue_depth: 8,
            max_consecutive_decode_errors: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    AwaitingFirstUnit,
    Decoding,
    /// Video ended; queued units are still being decoded
    Draining,
    Stopped,
    Error(MirrorError),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Error(_))
    }
}

/// Running counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    units_demuxed: AtomicU64,
    frames_decoded: AtomicU64,
    frames_presented: AtomicU64,
    frames_dropped: AtomicU64,
    decode_errors: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub units_demuxed: u64,
    pub frames_decoded: u64,
    pub frames_presented: u64,
    pub frames_dropped: u64,
    pub decode_errors: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            units_demuxed: self.units_demuxed.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_presented: self.frames_presented.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

type StateTx = Arc<watch::Sender<PipelineState>>;

/// Move to `next` unless a terminal state was already reached
fn advance(state: &StateTx, next: PipelineState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || *current == next {
            return false;
        }
        *current = next;
        true
    })
}

/// A running video pipeline for one session
pub struct VideoPipeline {
    state: StateTx,
    stats: Arc<PipelineStats>,
    slot: Arc<LatestFrame>,
    demux_task: Option<JoinHandle<()>>,
    decode_thread: Option<thread::JoinHandle<()>>,
    presenter_thread: Option<thread::JoinHandle<()>>,
}

impl VideoPipeline {
    /// Start all stages reading from `video`
    pub fn start(
        video: TunnelReader,
        meta: &VideoMeta,
        decoder: Box<dyn VideoDecoder>,
        draw: DrawCallback,
        config: &PipelineConfig,
    ) -> Result<Self, MirrorError> {
        let (state, _) = watch::channel(PipelineState::AwaitingFirstUnit);
        let state = Arc::new(state);
        let stats = Arc::new(PipelineStats::default());
        let slot = Arc::new(LatestFrame::new());
        let (units_tx, units_rx) = mpsc::channel(config.unit_queue_depth.max(1));

        let spawn_error =
            |e: std::io::Error| MirrorError::PipelineFailure(format!("Failed to spawn thread: {}", e));

        let presenter_thread = {
            let stats = Arc::clone(&stats);
            spawn_presenter(Arc::clone(&slot), draw, move |_| {
                stats.frames_presented.fetch_add(1, Ordering::Relaxed);
            })
            .map_err(spawn_error)?
        };

        let decode_thread = {
            let worker = DecodeWorker {
                decoder,
                units: units_rx,
                slot: Arc::clone(&slot),
                stats: Arc::clone(&stats),
                state: Arc::clone(&state),
                max_errors: config.max_consecutive_decode_errors.max(1),
            };
            let spawned = thread::Builder::new()
                .name("video-decode".to_string())
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    slot.discard();
                    return Err(spawn_error(e));
                }
            }
        };

        let mode = if meta.framed {
            DemuxMode::Framed
        } else {
            DemuxMode::AnnexB
        };
        let demux_task = tokio::spawn(demux_loop(
            video,
            AccessUnitDemuxer::new(mode),
            units_tx,
            Arc::clone(&stats),
            Arc::clone(&state),
        ));

        info!(
            "Video pipeline started for {} {}x{} ({:?})",
            meta.codec, meta.width, meta.height, mode
        );
        Ok(Self {
            state,
            stats,
            slot,
            demux_task: Some(demux_task),
            decode_thread: Some(decode_thread),
            presenter_thread: Some(presenter_thread),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Stop every stage and wait (bounded) for the threads to exit
    ///
    /// Pending frames are dropped. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(task) = self.demux_task.take() {
            task.abort();
        }
        self.slot.discard();
        advance(&self.state, PipelineState::Stopped);

        for (name, handle) in [
            ("video-decode", self.decode_thread.take()),
            ("frame-presenter", self.presenter_thread.take()),
        ] {
            let Some(handle) = handle else {
                continue;
            };
            let joined =
                tokio::time::timeout(THREAD_JOIN_TIMEOUT, tokio::task::spawn_blocking(move || handle.join()))
                    .await;
            match joined {
                Ok(Ok(Ok(()))) => debug!("{} thread joined", name),
                Ok(_) => warn!("{} thread panicked", name),
                Err(_) => warn!("{} thread did not exit within {:?}", name, THREAD_JOIN_TIMEOUT),
            }
        }
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        if let Some(task) = self.demux_task.take() {
            task.abort();
        }
        self.slot.discard();
    }
}

async fn demux_loop(
    mut video: TunnelReader,
    mut demuxer: AccessUnitDemuxer,
    units: mpsc::Sender<AccessUnit>,
    stats: Arc<PipelineStats>,
    state: StateTx,
) {
    loop {
        let chunk = match video.read_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                warn!("Video channel failed: {}", e);
                advance(&state, PipelineState::Error(e));
                return;
            }
        };

        let batch = match demuxer.push(&chunk) {
            Ok(batch) => batch,
            Err(e) => {
                error!("Video stream is corrupt: {}", e);
                advance(&state, PipelineState::Error(e));
                return;
            }
        };
        if !forward(batch, &units, &stats).await {
            return;
        }
    }

    info!("Video stream ended, draining");
    let rest = demuxer.finish();
    advance(&state, PipelineState::Draining);
    forward(rest, &units, &stats).await;
}

/// Queue units for decoding; false once the decoder is gone
async fn forward(
    batch: Vec<AccessUnit>,
    units: &mpsc::Sender<AccessUnit>,
    stats: &PipelineStats,
) -> bool {
    for unit in batch {
        stats.units_demuxed.fetch_add(1, Ordering::Relaxed);
        if units.send(unit).await.is_err() {
            return false;
        }
    }
    true
}

struct DecodeWorker {
    decoder: Box<dyn VideoDecoder>,
    units: mpsc::Receiver<AccessUnit>,
    slot: Arc<LatestFrame>,
    stats: Arc<PipelineStats>,
    state: StateTx,
    max_errors: u32,
}

impl DecodeWorker {
    fn run(mut self) {
        let mut consecutive = 0u32;
        while let Some(unit) = self.units.blocking_recv() {
            self.state.send_if_modified(|state| {
                let first = *state == PipelineState::AwaitingFirstUnit;
                if first {
                    *state = PipelineState::Decoding;
                }
                first
            });

            match self.decoder.decode(&unit) {
                Ok(frames) => {
                    consecutive = 0;
                    self.present(frames);
                }
                Err(MirrorError::DecodeError(reason)) => {
                    consecutive += 1;
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Skipping unit {}: {}", unit.index, reason);
                    if consecutive >= self.max_errors {
                        self.fail(MirrorError::PipelineFailure(format!(
                            "{} consecutive decode errors, last: {}",
                            consecutive, reason
                        )));
                        return;
                    }
                }
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }

        match self.decoder.flush() {
            Ok(frames) => self.present(frames),
            Err(e) => debug!("Decoder flush failed: {}", e),
        }
        self.slot.close();
        advance(&self.state, PipelineState::Stopped);
        debug!("Video decoder stopped");
    }

    fn present(&self, frames: Vec<DecodedFrame>) {
        for frame in frames {
            self.stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
            if self.slot.publish(frame).is_some() {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn fail(&self, error: MirrorError) {
        error!("Video pipeline failed: {}", error);
        self.slot.discard();
        advance(&self.state, PipelineState::Error(error));
    }
}

/// Wait until `state` reports the pipeline stopped or failed
///
/// A dropped pipeline counts as `Stopped`.
pub async fn terminal_state(state: &mut watch::Receiver<PipelineState>) -> PipelineState {
    match state.wait_for(PipelineState::is_terminal).await {
        Ok(state) => state.clone(),
        Err(_) => PipelineState::Stopped,
    }
}
