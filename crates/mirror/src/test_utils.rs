//! In-memory device doubles for tests
//!
//! [`memory_transport`] gives a [`Transport`] whose other end is a
//! [`DevicePeer`]; [`FakeDevice`] drives that peer like a phone running the
//! bridge daemon and the capture service.

use crate::capture::VideoMeta;
use crate::session::{EventSink, SessionEvent, SessionState};
use crate::usb::{DeviceProvider, DeviceSelector, Transport};
use crate::video::{AccessUnit, DecodedFrame, DecoderFactory, VideoDecoder};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use common::{DeviceInfo, HostKey, MirrorError, TransportError};
use protocol::capture::DEVICE_NAME_LEN;
use protocol::shell::{encode_shell_packet, encode_sub_frame};
use protocol::{
    AuthType, CodecMeta, Command, Frame, FrameDecoder, HOST_MAX_PAYLOAD, PacketHeader,
    ShellPacket, SubChannel, VideoCodec, encode_frame,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fail instead of hanging when `future` does not finish in time
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Shared RSA key; generating one per test is slow
pub fn test_host_key() -> Arc<HostKey> {
    static KEY: OnceLock<Arc<HostKey>> = OnceLock::new();
    KEY.get_or_init(|| Arc::new(HostKey::generate().expect("key generation")))
        .clone()
}

pub fn create_mock_device_info() -> DeviceInfo {
    DeviceInfo {
        vendor_id: 0x18d1,
        product_id: 0x4ee7,
        bus_number: 1,
        device_address: 4,
        manufacturer: Some("Google".to_string()),
        product: Some("Pixel 7".to_string()),
        serial_number: Some("FAKE0001".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Transport pair

/// Host end of an in-memory transport
pub struct MemoryTransport {
    info: DeviceInfo,
    to_device: mpsc::UnboundedSender<Bytes>,
    from_device: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    pending: tokio::sync::Mutex<BytesMut>,
    open: AtomicBool,
    released: AtomicBool,
    closed: CancellationToken,
    physical_closes: Arc<AtomicUsize>,
}

/// Device end of an in-memory transport
pub struct DevicePeer {
    to_host: Option<mpsc::UnboundedSender<Bytes>>,
    from_host: mpsc::UnboundedReceiver<Bytes>,
    host_closed: CancellationToken,
    decoder: FrameDecoder,
}

/// Counts how often the host end was really closed
#[derive(Clone)]
pub struct CloseCounter(Arc<AtomicUsize>);

impl CloseCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn memory_transport() -> (MemoryTransport, DevicePeer, CloseCounter) {
    let (to_device, from_host) = mpsc::unbounded_channel();
    let (to_host, from_device) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    let physical_closes = Arc::new(AtomicUsize::new(0));

    let transport = MemoryTransport {
        info: create_mock_device_info(),
        to_device,
        from_device: tokio::sync::Mutex::new(from_device),
        pending: tokio::sync::Mutex::new(BytesMut::new()),
        open: AtomicBool::new(true),
        released: AtomicBool::new(false),
        closed: closed.clone(),
        physical_closes: Arc::clone(&physical_closes),
    };
    let peer = DevicePeer {
        to_host: Some(to_host),
        from_host,
        host_closed: closed,
        decoder: FrameDecoder::new(HOST_MAX_PAYLOAD),
    };
    (transport, peer, CloseCounter(physical_closes))
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read(&self, max_len: usize) -> Result<Bytes, TransportError> {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            if !self.is_open() {
                return Err(TransportError::Disconnected);
            }
            let mut rx = self.from_device.lock().await;
            let chunk = tokio::select! {
                chunk = rx.recv() => chunk,
                _ = self.closed.cancelled() => None,
            };
            match chunk {
                Some(chunk) => pending.extend_from_slice(&chunk),
                None => {
                    self.open.store(false, Ordering::SeqCst);
                    return Err(TransportError::Disconnected);
                }
            }
        }
        let n = max_len.min(pending.len());
        Ok(pending.split_to(n).freeze())
    }

    async fn write(&self, data: Bytes) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Disconnected);
        }
        let len = data.len();
        self.to_device
            .send(data)
            .map_err(|_| TransportError::Disconnected)?;
        Ok(len)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if !self.released.swap(true, Ordering::SeqCst) {
            self.physical_closes.fetch_add(1, Ordering::SeqCst);
            self.closed.cancel();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn device(&self) -> &DeviceInfo {
        &self.info
    }
}

impl DevicePeer {
    /// Next frame from the host; `None` once the host closed or dropped
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(_) => return None,
            }
            let chunk = tokio::select! {
                biased;
                chunk = self.from_host.recv() => chunk?,
                _ = self.host_closed.cancelled() => return None,
            };
            self.decoder.extend(&chunk);
        }
    }

    pub fn send_frame(&self, frame: &Frame) {
        if let Ok(bytes) = encode_frame(frame) {
            self.send_raw(bytes);
        }
    }

    pub fn send_raw(&self, bytes: impl Into<Bytes>) {
        if let Some(tx) = &self.to_host {
            let _ = tx.send(bytes.into());
        }
    }

    /// Simulate unplugging: the host sees `Disconnected`
    pub fn detach(&mut self) {
        self.to_host = None;
    }
}

// ---------------------------------------------------------------------------
// Scripted device

/// How the device reacts to the host's CNXN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthBehavior {
    /// Host already authorised, no challenge
    Trusted,
    /// The stored key is known: the signature is accepted
    KnownKey,
    /// The signature is refused; the public key is approved by the user
    ApproveNewKey,
    /// The signature is refused and the user never approves the key
    NeverApprove,
    /// The device never answers CNXN
    Silent,
}

/// How the capture service behaves once launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureBehavior {
    /// Video and control through two forward `localabstract:` streams
    Forward,
    /// Video and control multiplexed inside the service stdout
    Inline,
    /// The device connects back to the host after `reverse:forward:`
    Reverse,
    /// The launch OPEN is refused
    RejectLaunch,
    /// The service prints an error and exits with this status
    ExitOnLaunch(u8),
    /// The service starts but its sockets never accept
    NoVideo,
    /// Both sockets accept, but nothing is ever sent on them
    SilentVideo,
}

#[derive(Debug, Clone)]
pub struct FakeDeviceConfig {
    pub auth: AuthBehavior,
    pub capture: CaptureBehavior,
    pub shell_v2: bool,
    pub max_payload: u32,
    pub device_name: String,
    pub width: u32,
    pub height: u32,
    /// Video bytes sent after the preamble
    pub video: Vec<u8>,
    /// Close the video stream once `video` has been sent
    pub end_video: bool,
    /// Stop answering OKAY for video writes after this many chunks
    pub stall_video_after: Option<usize>,
}

impl Default for FakeDeviceConfig {
    fn default() -> Self {
        Self {
            auth: AuthBehavior::Trusted,
            capture: CaptureBehavior::Forward,
            shell_v2: true,
            max_payload: HOST_MAX_PAYLOAD as u32,
            device_name: "Pixel 7".to_string(),
            width: 1080,
            height: 2400,
            video: Vec::new(),
            end_video: false,
            stall_video_after: None,
        }
    }
}

/// What the fake device observed
#[derive(Debug, Default, Clone)]
pub struct DeviceLog {
    pub opens: Vec<String>,
    /// Host stream ids the host closed
    pub host_closes: Vec<u32>,
    /// Destinations of the device streams the host closed
    pub closed_destinations: Vec<String>,
    pub signatures: usize,
    pub public_keys: usize,
    /// Bytes received through `sync:` DATA requests
    pub pushed_bytes: usize,
    /// Frames sent on a stream before the host acknowledged the OPEN
    pub premature_writes: usize,
}

struct DeviceStream {
    host_id: u32,
    destination: String,
    queue: VecDeque<Bytes>,
    awaiting_ack: bool,
    close_when_drained: bool,
    chunks_sent: usize,
    stall_after: Option<usize>,
    sync: Option<BytesMut>,
    /// Opened by the device, waiting for the host OKAY
    connecting: bool,
}

/// A scripted device running on the far end of a [`memory_transport`]
pub struct FakeDevice {
    config: FakeDeviceConfig,
    peer: DevicePeer,
    log: Arc<Mutex<DeviceLog>>,
    streams: HashMap<u32, DeviceStream>,
    next_id: u32,
    sockets_opened: usize,
    reverse_socket: Option<String>,
    unplug: CancellationToken,
}

impl FakeDevice {
    pub fn new(config: FakeDeviceConfig, peer: DevicePeer) -> Self {
        Self {
            config,
            peer,
            log: Arc::new(Mutex::new(DeviceLog::default())),
            streams: HashMap::new(),
            next_id: 100,
            sockets_opened: 0,
            reverse_socket: None,
            unplug: CancellationToken::new(),
        }
    }

    pub fn log(&self) -> Arc<Mutex<DeviceLog>> {
        Arc::clone(&self.log)
    }

    /// Cancelling the token pulls the cable
    pub fn unplug_token(&self) -> CancellationToken {
        self.unplug.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                frame = self.peer.next_frame() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => return,
                },
                _ = self.unplug.cancelled() => {
                    self.peer.detach();
                    return;
                }
            }
        }
    }

    fn banner(&self) -> String {
        let features = if self.config.shell_v2 {
            "shell_v2,cmd"
        } else {
            "cmd"
        };
        format!(
            "device::ro.product.name=fake;ro.product.model={};features={}",
            self.config.device_name, features
        )
    }

    fn accept_connection(&self) {
        let banner = self.banner();
        self.peer
            .send_frame(&Frame::connect(0x0100_0001, self.config.max_payload, &banner));
    }

    fn challenge(&self) {
        self.peer
            .send_frame(&Frame::auth(AuthType::Token, vec![7u8; 20]));
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame.command {
            Command::Cnxn => match self.config.auth {
                AuthBehavior::Trusted => self.accept_connection(),
                AuthBehavior::Silent => {}
                _ => self.challenge(),
            },
            Command::Auth => self.on_auth(frame),
            Command::Open => self.on_open(frame.arg0, frame.payload_str()),
            Command::Okay => self.on_okay(frame.arg0, frame.arg1),
            Command::Wrte => self.on_write(frame.arg0, frame.arg1, frame.payload),
            Command::Clse => {
                let closed = self.streams.remove(&frame.arg1);
                let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
                log.host_closes.push(frame.arg0);
                if let Some(stream) = closed {
                    log.closed_destinations.push(stream.destination);
                }
            }
            _ => {}
        }
    }

    fn on_auth(&mut self, frame: Frame) {
        match AuthType::try_from(frame.arg0) {
            Ok(AuthType::Signature) => {
                self.log.lock().unwrap_or_else(PoisonError::into_inner).signatures += 1;
                if self.config.auth == AuthBehavior::KnownKey {
                    self.accept_connection();
                } else {
                    self.challenge();
                }
            }
            Ok(AuthType::RsaPublicKey) => {
                self.log.lock().unwrap_or_else(PoisonError::into_inner).public_keys += 1;
                if self.config.auth == AuthBehavior::ApproveNewKey {
                    self.accept_connection();
                }
            }
            _ => {}
        }
    }

    fn on_open(&mut self, host_id: u32, destination: String) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).opens.push(destination.clone());

        if destination.starts_with("shell") {
            self.on_launch(host_id, &destination);
        } else if destination.starts_with("localabstract:scrcpy_") {
            if !matches!(
                self.config.capture,
                CaptureBehavior::Forward | CaptureBehavior::SilentVideo
            ) {
                self.peer.send_frame(&Frame::close(0, host_id));
                return;
            }
            self.sockets_opened += 1;
            let id = self.accept(host_id, &destination);
            if self.sockets_opened == 1 && self.config.capture == CaptureBehavior::Forward {
                let mut preamble = vec![0u8];
                preamble.extend(self.video_preamble());
                preamble.extend_from_slice(&self.config.video);
                let stall = self.config.stall_video_after;
                let end = self.config.end_video;
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.stall_after = stall;
                    stream.close_when_drained = end;
                }
                self.queue(id, &preamble);
            }
        } else if let Some(forward) = destination.strip_prefix("reverse:forward:") {
            if self.config.capture != CaptureBehavior::Reverse {
                self.peer.send_frame(&Frame::close(0, host_id));
                return;
            }
            self.reverse_socket = forward.split(';').next().map(str::to_string);
            let id = self.accept(host_id, &destination);
            self.queue(id, b"OKAY");
        } else if destination == "sync:" {
            let id = self.accept(host_id, &destination);
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.sync = Some(BytesMut::new());
            }
        } else {
            self.peer.send_frame(&Frame::close(0, host_id));
        }
    }

    fn on_launch(&mut self, host_id: u32, destination: &str) {
        let shell_v2 = destination.starts_with("shell,v2");
        let stdout = |data: &[u8]| -> Vec<u8> {
            if shell_v2 {
                encode_shell_packet(&ShellPacket::Stdout(Bytes::copy_from_slice(data)))
            } else {
                data.to_vec()
            }
        };

        match self.config.capture.clone() {
            CaptureBehavior::RejectLaunch => {
                self.peer.send_frame(&Frame::close(0, host_id));
            }
            CaptureBehavior::ExitOnLaunch(code) => {
                let id = self.accept(host_id, destination);
                let mut out = encode_shell_packet(&ShellPacket::Stderr(Bytes::from_static(
                    b"ERROR: Could not find encoder\n",
                )));
                out.extend(encode_shell_packet(&ShellPacket::Exit(code)));
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.close_when_drained = true;
                }
                self.queue(id, &out);
            }
            CaptureBehavior::Forward | CaptureBehavior::NoVideo | CaptureBehavior::SilentVideo => {
                let id = self.accept(host_id, destination);
                self.queue(id, &stdout(b"[server] INFO: Device: fake\n"));
            }
            CaptureBehavior::Reverse => {
                let id = self.accept(host_id, destination);
                self.queue(id, &stdout(b"[server] INFO: Device: fake\n"));
                let Some(socket) = self.reverse_socket.clone() else {
                    return;
                };
                let video = self.connect_back(&socket);
                let _control = self.connect_back(&socket);
                let mut preamble = self.video_preamble();
                preamble.extend_from_slice(&self.config.video);
                self.queue(video, &preamble);
            }
            CaptureBehavior::Inline => {
                let id = self.accept(host_id, destination);
                let mut video = self.video_preamble();
                video.extend_from_slice(&self.config.video);
                let mut out = stdout(&encode_sub_frame(SubChannel::Control, &[]));
                for chunk in video.chunks(4096) {
                    out.extend(stdout(&encode_sub_frame(SubChannel::Video, chunk)));
                }
                let end = self.config.end_video;
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.close_when_drained = end;
                }
                self.queue(id, &out);
            }
        }
    }

    fn video_preamble(&self) -> Vec<u8> {
        let mut name = [0u8; DEVICE_NAME_LEN];
        let len = self.config.device_name.len().min(DEVICE_NAME_LEN - 1);
        name[..len].copy_from_slice(&self.config.device_name.as_bytes()[..len]);
        let mut out = name.to_vec();
        out.extend_from_slice(
            &CodecMeta {
                codec: VideoCodec::H264,
                width: self.config.width,
                height: self.config.height,
            }
            .to_bytes(),
        );
        out
    }

    fn insert_stream(&mut self, host_id: u32, destination: &str, connecting: bool) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.streams.insert(
            id,
            DeviceStream {
                host_id,
                destination: destination.to_string(),
                queue: VecDeque::new(),
                awaiting_ack: false,
                close_when_drained: false,
                chunks_sent: 0,
                stall_after: None,
                sync: None,
                connecting,
            },
        );
        id
    }

    fn accept(&mut self, host_id: u32, destination: &str) -> u32 {
        let id = self.insert_stream(host_id, destination, false);
        self.peer.send_frame(&Frame::okay(id, host_id));
        id
    }

    /// Open a stream towards the host, as a reverse tunnel does
    fn connect_back(&mut self, destination: &str) -> u32 {
        let id = self.insert_stream(0, destination, true);
        self.peer.send_frame(&Frame::open(id, destination));
        id
    }

    fn queue(&mut self, id: u32, data: &[u8]) {
        let max = self.config.max_payload as usize;
        if let Some(stream) = self.streams.get_mut(&id) {
            for chunk in data.chunks(max) {
                stream.queue.push_back(Bytes::copy_from_slice(chunk));
            }
        }
        self.pump(id);
    }

    /// Send the next queued chunk if the previous one was acknowledged
    fn pump(&mut self, id: u32) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if stream.awaiting_ack || stream.connecting {
            return;
        }
        if stream.stall_after.is_some_and(|n| stream.chunks_sent >= n) {
            return;
        }
        match stream.queue.pop_front() {
            Some(chunk) => {
                stream.awaiting_ack = true;
                stream.chunks_sent += 1;
                self.peer.send_frame(&Frame::write(id, stream.host_id, chunk));
            }
            None if stream.close_when_drained => {
                let host_id = stream.host_id;
                self.streams.remove(&id);
                self.peer.send_frame(&Frame::close(id, host_id));
            }
            None => {}
        }
    }

    fn on_okay(&mut self, host_id: u32, id: u32) {
        if let Some(stream) = self.streams.get_mut(&id) {
            if stream.connecting {
                stream.connecting = false;
                stream.host_id = host_id;
            } else {
                stream.awaiting_ack = false;
            }
        }
        self.pump(id);
    }

    fn on_write(&mut self, host_id: u32, id: u32, payload: Bytes) {
        let Some(stream) = self.streams.get_mut(&id) else {
            self.log.lock().unwrap_or_else(PoisonError::into_inner).premature_writes += 1;
            return;
        };
        self.peer.send_frame(&Frame::okay(id, host_id));

        let Some(buffer) = stream.sync.as_mut() else {
            return;
        };
        buffer.extend_from_slice(&payload);
        let mut done = false;
        while buffer.len() >= 8 {
            let len = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
            match &buffer[..4] {
                b"DONE" => {
                    let _ = buffer.split_to(8);
                    done = true;
                }
                b"SEND" | b"DATA" => {
                    if buffer.len() < 8 + len {
                        break;
                    }
                    if &buffer[..4] == b"DATA" {
                        self.log.lock().unwrap_or_else(PoisonError::into_inner).pushed_bytes += len;
                    }
                    let _ = buffer.split_to(8 + len);
                }
                _ => break,
            }
        }
        if done {
            self.queue(id, b"OKAY\0\0\0\0");
        }
    }
}

/// A framed video packet as the capture service sends it
pub fn framed_packet(pts: Option<u64>, config: bool, key_frame: bool, data: &[u8]) -> Vec<u8> {
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

// ---------------------------------------------------------------------------
// Session plumbing

/// Hands out prepared transports, or fails, or never answers
pub struct TestProvider {
    transports: Mutex<VecDeque<Arc<dyn Transport>>>,
    error: Option<TransportError>,
    hang: bool,
}

impl TestProvider {
    pub fn new(transport: MemoryTransport) -> Self {
        Self::with_transports(vec![Arc::new(transport)])
    }

    pub fn with_transports(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self {
            transports: Mutex::new(transports.into()),
            error: None,
            hang: false,
        }
    }

    pub fn failing(error: TransportError) -> Self {
        Self {
            transports: Mutex::new(VecDeque::new()),
            error: Some(error),
            hang: false,
        }
    }

    /// Device selection that never completes (the user never picks)
    pub fn hanging() -> Self {
        Self {
            transports: Mutex::new(VecDeque::new()),
            error: None,
            hang: true,
        }
    }
}

#[async_trait]
impl DeviceProvider for TestProvider {
    async fn open_device(
        &self,
        _selector: &DeviceSelector,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        self.transports
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::NoDeviceSelected)
    }
}

/// Event sink that keeps every event
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> EventSink {
        let events = Arc::clone(&self.events);
        Arc::new(move |event| events.lock().unwrap_or_else(PoisonError::into_inner).push(event))
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// States entered, in order
    pub fn states(&self) -> Vec<SessionState> {
        self.events().iter().filter_map(|e| e.state).collect()
    }

    pub fn errors(&self) -> Vec<SessionEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.state == Some(SessionState::Error))
            .collect()
    }
}

/// Decoder producing a 2x2 frame per unit; units starting with `BAD` fail
pub struct FakeDecoder {
    pub delay: Duration,
}

impl VideoDecoder for FakeDecoder {
    fn decode(&mut self, unit: &AccessUnit) -> Result<Vec<DecodedFrame>, MirrorError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if unit.data.starts_with(b"BAD") {
            return Err(MirrorError::DecodeError(format!("unit {} is garbage", unit.index)));
        }
        Ok(vec![DecodedFrame {
            width: 2,
            height: 2,
            pixels: vec![unit.index as u8; 16],
            timestamp: unit.pts,
            index: unit.index,
        }])
    }
}

pub fn fake_decoder_factory() -> DecoderFactory {
    Arc::new(|_meta: &VideoMeta| -> Result<Box<dyn VideoDecoder>, MirrorError> {
        Ok(Box::new(FakeDecoder {
            delay: Duration::ZERO,
        }))
    })
}
