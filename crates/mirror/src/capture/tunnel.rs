//! Normalised control and video channels plus the service watchdog
//!
//! Whatever shape the capture service uses (separate streams or channels
//! multiplexed into its stdout), callers see two [`TunnelReader`]s and a
//! [`ServiceMonitor`] for the stream that launched the service.

use crate::bridge::LogicalStream;
use bytes::{Bytes, BytesMut};
use common::MirrorError;
use protocol::{ShellPacket, ShellV2Decoder, SubChannel, SubFrameDecoder};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Depth of the per-channel queues fed by the inline demuxer
const INLINE_QUEUE_DEPTH: usize = 64;

/// Receives service output lines, already prefixed
pub type OutputSink = Arc<dyn Fn(String) + Send + Sync>;

enum Source {
    Stream(LogicalStream),
    Channel(mpsc::Receiver<Result<Bytes, MirrorError>>),
}

/// Byte reader over one tunnel channel
pub struct TunnelReader {
    source: Source,
    buffer: BytesMut,
}

impl TunnelReader {
    pub fn from_stream(stream: LogicalStream) -> Self {
        Self {
            source: Source::Stream(stream),
            buffer: BytesMut::new(),
        }
    }

    pub(crate) fn from_channel(rx: mpsc::Receiver<Result<Bytes, MirrorError>>) -> Self {
        Self {
            source: Source::Channel(rx),
            buffer: BytesMut::new(),
        }
    }

    /// Next chunk of bytes, `None` at end of stream
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, MirrorError> {
        if !self.buffer.is_empty() {
            return Ok(Some(self.buffer.split().freeze()));
        }
        match &mut self.source {
            Source::Stream(stream) => Ok(stream.read().await?),
            Source::Channel(rx) => rx.recv().await.transpose(),
        }
    }

    /// Exactly `len` bytes, `None` if the stream ends first
    pub async fn read_exact(&mut self, len: usize) -> Result<Option<Bytes>, MirrorError> {
        while self.buffer.len() < len {
            let chunk = match &mut self.source {
                Source::Stream(stream) => stream.read().await?,
                Source::Channel(rx) => rx.recv().await.transpose()?,
            };
            match chunk {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => return Ok(None),
            }
        }
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    pub fn close(&mut self) {
        match &mut self.source {
            Source::Stream(stream) => stream.close(),
            Source::Channel(rx) => rx.close(),
        }
    }
}

impl std::fmt::Debug for TunnelReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source {
            Source::Stream(_) => "stream",
            Source::Channel(_) => "channel",
        };
        f.debug_struct("TunnelReader")
            .field("source", &kind)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

/// State of the process behind the service stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    /// Exit status reported through shell v2
    Exited(u8),
    /// The stream closed without an exit status
    Closed,
    /// Output could not be parsed or the link failed
    Broken(String),
}

impl ServiceStatus {
    fn into_error(self) -> MirrorError {
        let reason = match self {
            ServiceStatus::Running => "capture service is still running".to_string(),
            ServiceStatus::Exited(code) => format!("capture service exited with status {}", code),
            ServiceStatus::Closed => "capture service stream closed".to_string(),
            ServiceStatus::Broken(reason) => format!("capture service output: {}", reason),
        };
        MirrorError::CaptureServiceUnavailable(reason)
    }
}

/// Watches the stream that launched the capture service
///
/// Forwards stdout/stderr lines to the output sink and, for inline tunnels,
/// splits stdout into the control and video channels.
pub struct ServiceMonitor {
    status: watch::Receiver<ServiceStatus>,
    task: JoinHandle<()>,
}

/// Senders for the two inline channels
pub(crate) struct InlineChannels {
    control: mpsc::Sender<Result<Bytes, MirrorError>>,
    video: mpsc::Sender<Result<Bytes, MirrorError>>,
}

impl InlineChannels {
    /// Create the channel pair and the readers for both ends
    pub(crate) fn new() -> (Self, TunnelReader, TunnelReader) {
        let (control_tx, control_rx) = mpsc::channel(INLINE_QUEUE_DEPTH);
        let (video_tx, video_rx) = mpsc::channel(INLINE_QUEUE_DEPTH);
        (
            Self {
                control: control_tx,
                video: video_tx,
            },
            TunnelReader::from_channel(control_rx),
            TunnelReader::from_channel(video_rx),
        )
    }

    async fn fail(&self, error: MirrorError) {
        let _ = self.control.send(Err(error.clone())).await;
        let _ = self.video.send(Err(error)).await;
    }
}

impl ServiceMonitor {
    pub(crate) fn spawn(
        stream: LogicalStream,
        shell_v2: bool,
        inline: Option<InlineChannels>,
        on_output: OutputSink,
    ) -> Self {
        let (tx, rx) = watch::channel(ServiceStatus::Running);
        let task = tokio::spawn(async move {
            let mut output = ServiceOutput {
                stream,
                shell_v2,
                shell: ShellV2Decoder::new(),
                inline,
                sub_frames: SubFrameDecoder::new(),
                stdout_line: String::new(),
                stderr_line: String::new(),
                on_output,
            };
            let status = output.run().await;
            output.flush_lines();
            if let (ServiceStatus::Broken(reason), Some(inline)) = (&status, &output.inline) {
                inline
                    .fail(MirrorError::CaptureServiceUnavailable(reason.clone()))
                    .await;
            }
            debug!("Capture service stream ended: {:?}", status);
            let _ = tx.send(status);
        });
        Self { status: rx, task }
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.borrow().clone()
    }

    /// Wait for the service to stop running and describe why it did
    pub async fn failed(&self) -> MirrorError {
        let mut rx = self.status.clone();
        let status = match rx.wait_for(|s| *s != ServiceStatus::Running).await {
            Ok(status) => status.clone(),
            Err(_) => ServiceStatus::Closed,
        };
        status.into_error()
    }

    /// Stop watching; dropping the stream closes it
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ServiceMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ServiceOutput {
    stream: LogicalStream,
    shell_v2: bool,
    shell: ShellV2Decoder,
    inline: Option<InlineChannels>,
    sub_frames: SubFrameDecoder,
    stdout_line: String,
    stderr_line: String,
    on_output: OutputSink,
}

impl ServiceOutput {
    async fn run(&mut self) -> ServiceStatus {
        loop {
            let chunk = match self.stream.read().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return ServiceStatus::Closed,
                Err(e) => return ServiceStatus::Broken(e.to_string()),
            };

            if !self.shell_v2 {
                if let Err(reason) = self.on_stdout(&chunk).await {
                    return ServiceStatus::Broken(reason);
                }
                continue;
            }

            self.shell.extend(&chunk);
            loop {
                let packet = match self.shell.next_packet() {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break,
                    Err(e) => return ServiceStatus::Broken(e.to_string()),
                };
                match packet {
                    ShellPacket::Stdout(data) => {
                        if let Err(reason) = self.on_stdout(&data).await {
                            return ServiceStatus::Broken(reason);
                        }
                    }
                    ShellPacket::Stderr(data) => {
                        push_lines(&mut self.stderr_line, &data, &self.on_output)
                    }
                    ShellPacket::Exit(code) => return ServiceStatus::Exited(code),
                    other => debug!("Ignoring service packet {:?}", other),
                }
            }
        }
    }

    async fn on_stdout(&mut self, data: &[u8]) -> Result<(), String> {
        let Some(inline) = &self.inline else {
            push_lines(&mut self.stdout_line, data, &self.on_output);
            return Ok(());
        };

        self.sub_frames.extend(data);
        while let Some((channel, payload)) =
            self.sub_frames.next_sub_frame().map_err(|e| e.to_string())?
        {
            let target = match channel {
                SubChannel::Control => &inline.control,
                SubChannel::Video => &inline.video,
            };
            if target.send(Ok(payload)).await.is_err() {
                debug!("Dropping {:?} sub-frame, reader gone", channel);
            }
        }
        Ok(())
    }

    fn flush_lines(&mut self) {
        for pending in [&mut self.stdout_line, &mut self.stderr_line] {
            let line = std::mem::take(pending);
            emit_line(line.trim_end(), &self.on_output);
        }
    }
}

fn push_lines(pending: &mut String, data: &[u8], on_output: &OutputSink) {
    pending.push_str(&String::from_utf8_lossy(data));
    while let Some(pos) = pending.find('\n') {
        let line: String = pending.drain(..=pos).collect();
        emit_line(line.trim_end(), on_output);
    }
}

fn emit_line(line: &str, on_output: &OutputSink) {
    if line.is_empty() {
        return;
    }
    if line.starts_with("ERROR") {
        warn!("capture service: {}", line);
    }
    on_output(format!("capture service: {}", line));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_sink() -> (OutputSink, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&lines);
        let sink: OutputSink = Arc::new(move |line| captured.lock().unwrap().push(line));
        (sink, lines)
    }

    #[test]
    fn test_push_lines_splits_across_chunks() {
        let (sink, lines) = collecting_sink();
        let mut pending = String::new();
        push_lines(&mut pending, b"[server] INFO: Dev", &sink);
        assert!(lines.lock().unwrap().is_empty());
        push_lines(&mut pending, b"ice: Pixel\r\n\nnext", &sink);
        assert_eq!(
            *lines.lock().unwrap(),
            vec!["capture service: [server] INFO: Device: Pixel".to_string()]
        );
        assert_eq!(pending, "next");
    }

    #[test]
    fn test_status_errors() {
        assert_eq!(
            ServiceStatus::Exited(1).into_error(),
            MirrorError::CaptureServiceUnavailable(
                "capture service exited with status 1".to_string()
            )
        );
        assert!(matches!(
            ServiceStatus::Closed.into_error(),
            MirrorError::CaptureServiceUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_channel_reader_read_exact() {
        let (tx, rx) = mpsc::channel(4);
        let mut reader = TunnelReader::from_channel(rx);
        tx.send(Ok(Bytes::from_static(b"abc"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"defg"))).await.unwrap();

        assert_eq!(&reader.read_exact(5).await.unwrap().unwrap()[..], b"abcde");
        assert_eq!(&reader.read_chunk().await.unwrap().unwrap()[..], b"fg");

        drop(tx);
        assert_eq!(reader.read_exact(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_channel_reader_surfaces_errors() {
        let (tx, rx) = mpsc::channel(4);
        let mut reader = TunnelReader::from_channel(rx);
        tx.send(Err(MirrorError::Disconnected)).await.unwrap();
        assert_eq!(reader.read_chunk().await, Err(MirrorError::Disconnected));
    }
}
