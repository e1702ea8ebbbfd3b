//! Stream multiplexer over one bridge connection
//!
//! All frames are written by a single writer task, in the order they were
//! queued, and read by a single reader task that dispatches them to the
//! owning stream. Any integrity or sequencing fault is fatal for the whole
//! connection: the transport is dropped and every stream sees the error.

use crate::bridge::auth::Authenticator;
use crate::bridge::handshake::{HandshakeProgress, READ_CHUNK, perform_handshake};
use crate::bridge::stream::LogicalStream;
use crate::bridge::BridgeError;
use crate::usb::Transport;
use bytes::Bytes;
use common::{HostKey, MirrorError};
use protocol::{
    Command, ConnectionParams, DeviceBanner, Frame, FrameDecoder, HOST_MAX_PAYLOAD, LocalId,
    RemoteId, encode_frame,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time allowed for queued frames to drain on shutdown
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(1);

/// Connection tunables
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Time for the device to answer CNXN or a signature
    pub handshake_timeout: Duration,
    /// Time for the user to approve the host key on the device
    pub auth_timeout: Duration,
    /// Time for the device to answer an OPEN
    pub open_timeout: Duration,
    /// Largest payload the host accepts
    pub max_payload: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(10),
            max_payload: HOST_MAX_PAYLOAD,
        }
    }
}

/// Health of the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Open,
    /// Shut down locally
    Closed,
    Failed(MirrorError),
}

/// Notifications delivered to a stream by the reader task
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Ready { remote_id: u32 },
    Data(Bytes),
    /// The device acknowledged our last WRTE
    Acked,
    /// The device closed the stream (or rejected the OPEN)
    Closed,
    Failed(MirrorError),
}

pub(crate) enum Outbound {
    Frame(Frame),
    Shutdown,
}

struct StreamSlot {
    remote_id: Option<u32>,
    events: mpsc::UnboundedSender<StreamEvent>,
    write_in_flight: bool,
    peer_write_unacked: bool,
}

struct StreamTable {
    slots: HashMap<u32, StreamSlot>,
    /// Ids closed locally; late frames for them are dropped
    retired: HashSet<u32>,
    /// Retired ids whose OPEN was never answered
    abandoned: HashSet<u32>,
    next_local_id: u32,
    acceptor: Option<mpsc::UnboundedSender<LogicalStream>>,
}

impl StreamTable {
    fn allocate(&mut self) -> u32 {
        let id = self.next_local_id;
        self.next_local_id += 1;
        id
    }

    /// Slot for `local`, `None` for a retired id, error for an unknown one
    fn lookup(&mut self, local: u32, what: Command) -> Result<Option<&mut StreamSlot>, MirrorError> {
        if self.slots.contains_key(&local) {
            return Ok(self.slots.get_mut(&local));
        }
        if self.retired.contains(&local) {
            debug!("Dropping {} for closed stream {}", what, LocalId(local));
            return Ok(None);
        }
        Err(MirrorError::ProtocolViolation(format!(
            "{} for unknown stream {}",
            what,
            LocalId(local)
        )))
    }
}

/// State shared between the connection, its streams and its I/O tasks
pub(crate) struct Shared {
    transport: Arc<dyn Transport>,
    outbound: mpsc::UnboundedSender<Outbound>,
    table: Mutex<StreamTable>,
    status: watch::Sender<LinkStatus>,
    pub(crate) max_payload: usize,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, StreamTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link_error(&self) -> Option<MirrorError> {
        match &*self.status.borrow() {
            LinkStatus::Open => None,
            LinkStatus::Closed => Some(MirrorError::Disconnected),
            LinkStatus::Failed(e) => Some(e.clone()),
        }
    }

    pub(crate) fn send(&self, frame: Frame) -> Result<(), MirrorError> {
        if let Some(e) = self.link_error() {
            return Err(e);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| MirrorError::Disconnected)
    }

    /// Mark our WRTE on `local` as outstanding; returns the remote id
    pub(crate) fn begin_write(&self, local: u32) -> Result<u32, BridgeError> {
        let mut table = self.table();
        let slot = table.slots.get_mut(&local).ok_or(BridgeError::StreamNotOpen)?;
        let remote = slot.remote_id.ok_or(BridgeError::StreamNotOpen)?;
        if slot.write_in_flight {
            return Err(BridgeError::Link(MirrorError::ProtocolViolation(format!(
                "second WRTE on {} before OKAY",
                LocalId(local)
            ))));
        }
        slot.write_in_flight = true;
        Ok(remote)
    }

    /// Acknowledge the peer's WRTE once its data has been consumed
    pub(crate) fn ack_peer_write(&self, local: u32) {
        let frame = {
            let mut table = self.table();
            match table.slots.get_mut(&local) {
                Some(slot) if slot.peer_write_unacked => {
                    slot.peer_write_unacked = false;
                    slot.remote_id.map(|remote| Frame::okay(local, remote))
                }
                _ => None,
            }
        };
        if let Some(frame) = frame {
            let _ = self.send(frame);
        }
    }

    /// Close a stream from our side
    pub(crate) fn close_stream(&self, local: u32) {
        let remote = {
            let mut table = self.table();
            table.retired.insert(local);
            match table.slots.remove(&local) {
                Some(slot) if slot.remote_id.is_none() => {
                    table.abandoned.insert(local);
                    None
                }
                slot => slot.and_then(|slot| slot.remote_id),
            }
        };
        if let Some(remote) = remote {
            debug!("Closing stream {} ({})", LocalId(local), RemoteId(remote));
            let _ = self.send(Frame::close(local, remote));
        }
    }

    /// Tear the connection down after a fatal error
    fn fail(&self, error: MirrorError) {
        let first = self.status.send_if_modified(|status| {
            if *status == LinkStatus::Open {
                *status = LinkStatus::Failed(error.clone());
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        warn!("Bridge connection failed: {}", error);
        let slots: Vec<StreamSlot> = {
            let mut table = self.table();
            table.acceptor = None;
            let ids: Vec<u32> = table.slots.keys().copied().collect();
            table.retired.extend(ids);
            table.slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let _ = slot.events.send(StreamEvent::Failed(error.clone()));
        }

        self.transport.close();
        let _ = self.outbound.send(Outbound::Shutdown);
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<(), MirrorError> {
        match frame.command {
            Command::Okay => self.on_okay(frame.arg0, frame.arg1),
            Command::Wrte => self.on_write(frame.arg0, frame.arg1, frame.payload),
            Command::Clse => self.on_close(frame.arg0, frame.arg1),
            Command::Open => {
                let destination = frame.payload_str();
                self.on_open(frame.arg0, destination)
            }
            Command::Sync => {
                debug!("Ignoring SYNC");
                Ok(())
            }
            other => Err(MirrorError::ProtocolViolation(format!(
                "unexpected {} on an established connection",
                other
            ))),
        }
    }

    fn on_okay(&self, remote: u32, local: u32) -> Result<(), MirrorError> {
        let mut table = self.table();
        if table.abandoned.remove(&local) {
            drop(table);
            debug!(
                "Late OKAY from {} for abandoned {}, closing",
                RemoteId(remote),
                LocalId(local)
            );
            let _ = self.send(Frame::close(local, remote));
            return Ok(());
        }
        let Some(slot) = table.lookup(local, Command::Okay)? else {
            return Ok(());
        };

        match slot.remote_id {
            None => {
                slot.remote_id = Some(remote);
                let _ = slot.events.send(StreamEvent::Ready { remote_id: remote });
            }
            Some(bound) if bound != remote => {
                return Err(MirrorError::ProtocolViolation(format!(
                    "OKAY from {} for {} bound to {}",
                    RemoteId(remote),
                    LocalId(local),
                    RemoteId(bound)
                )));
            }
            Some(_) if slot.write_in_flight => {
                slot.write_in_flight = false;
                let _ = slot.events.send(StreamEvent::Acked);
            }
            Some(_) => debug!("Ignoring unsolicited OKAY on {}", LocalId(local)),
        }
        Ok(())
    }

    fn on_write(&self, remote: u32, local: u32, payload: Bytes) -> Result<(), MirrorError> {
        let mut table = self.table();
        let Some(slot) = table.lookup(local, Command::Wrte)? else {
            return Ok(());
        };

        match slot.remote_id {
            None => {
                return Err(MirrorError::ProtocolViolation(format!(
                    "WRTE on {} before its OPEN was answered",
                    LocalId(local)
                )));
            }
            Some(bound) if bound != remote => {
                return Err(MirrorError::ProtocolViolation(format!(
                    "WRTE from {} on {} bound to {}",
                    RemoteId(remote),
                    LocalId(local),
                    RemoteId(bound)
                )));
            }
            Some(_) => {}
        }

        if slot.peer_write_unacked {
            return Err(MirrorError::ProtocolViolation(format!(
                "WRTE on {} before the previous one was acknowledged",
                LocalId(local)
            )));
        }
        slot.peer_write_unacked = true;
        let _ = slot.events.send(StreamEvent::Data(payload));
        Ok(())
    }

    fn on_close(&self, remote: u32, local: u32) -> Result<(), MirrorError> {
        let mut table = self.table();
        table.abandoned.remove(&local);
        if table.lookup(local, Command::Clse)?.is_none() {
            return Ok(());
        }

        table.retired.insert(local);
        if let Some(slot) = table.slots.remove(&local) {
            debug!("Device closed {} ({})", LocalId(local), RemoteId(remote));
            let _ = slot.events.send(StreamEvent::Closed);
        }
        Ok(())
    }

    fn on_open(self: &Arc<Self>, remote: u32, destination: String) -> Result<(), MirrorError> {
        let mut table = self.table();
        let acceptor = table.acceptor.clone().filter(|tx| !tx.is_closed());
        let Some(acceptor) = acceptor else {
            debug!("Refusing device OPEN {} ({})", destination, RemoteId(remote));
            drop(table);
            let _ = self.send(Frame::close(0, remote));
            return Ok(());
        };

        let local = table.allocate();
        let (tx, rx) = mpsc::unbounded_channel();
        table.slots.insert(
            local,
            StreamSlot {
                remote_id: Some(remote),
                events: tx,
                write_in_flight: false,
                peer_write_unacked: false,
            },
        );
        drop(table);

        debug!(
            "Accepted device OPEN {} as {} ({})",
            destination,
            LocalId(local),
            RemoteId(remote)
        );
        self.send(Frame::okay(local, remote))?;

        let stream = LogicalStream::new(local, remote, destination, Arc::clone(self), rx);
        if let Err(mpsc::error::SendError(mut stream)) = acceptor.send(stream) {
            stream.close();
        }
        Ok(())
    }
}

/// An authenticated connection to one device
pub struct BridgeConnection {
    shared: Arc<Shared>,
    params: ConnectionParams,
    banner: DeviceBanner,
    open_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeConnection {
    /// Handshake with the device and start the I/O tasks
    ///
    /// `progress` is told about authentication milestones so the caller can
    /// prompt the user.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        key: Arc<HostKey>,
        options: &BridgeOptions,
        progress: &(dyn Fn(HandshakeProgress) + Send + Sync),
    ) -> Result<Self, MirrorError> {
        let mut decoder = FrameDecoder::new(options.max_payload);
        let mut auth = Authenticator::new(key);

        let outcome =
            match perform_handshake(transport.as_ref(), &mut decoder, &mut auth, options, progress)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    if matches!(e, MirrorError::ProtocolViolation(_)) {
                        transport.close();
                    }
                    return Err(e);
                }
            };

        // Payloads above the negotiated size are a protocol fault from here on
        decoder.set_max_payload(outcome.params.max_payload);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(LinkStatus::Open);
        let shared = Arc::new(Shared {
            transport,
            outbound,
            table: Mutex::new(StreamTable {
                slots: HashMap::new(),
                retired: HashSet::new(),
                abandoned: HashSet::new(),
                next_local_id: 1,
                acceptor: None,
            }),
            status,
            max_payload: outcome.params.max_payload,
        });

        let reader = tokio::spawn(read_loop(Arc::clone(&shared), decoder));
        let writer = tokio::spawn(write_loop(Arc::clone(&shared), outbound_rx));

        Ok(Self {
            shared,
            params: outcome.params,
            banner: outcome.banner,
            open_timeout: options.open_timeout,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn banner(&self) -> &DeviceBanner {
        &self.banner
    }

    pub fn params(&self) -> ConnectionParams {
        self.params
    }

    pub fn max_payload(&self) -> usize {
        self.shared.max_payload
    }

    pub fn status(&self) -> LinkStatus {
        self.shared.status.borrow().clone()
    }

    /// Wait until the connection is no longer open
    pub async fn closed(&self) -> LinkStatus {
        let mut rx = self.shared.status.subscribe();
        match rx.wait_for(|s| *s != LinkStatus::Open).await {
            Ok(status) => status.clone(),
            Err(_) => LinkStatus::Closed,
        }
    }

    /// Open a stream to `destination` and wait for the device to accept it
    pub async fn open(&self, destination: &str) -> Result<LogicalStream, BridgeError> {
        if let Some(e) = self.shared.link_error() {
            return Err(BridgeError::Link(e));
        }

        let (local, mut events) = {
            let mut table = self.shared.table();
            let local = table.allocate();
            let (tx, rx) = mpsc::unbounded_channel();
            table.slots.insert(
                local,
                StreamSlot {
                    remote_id: None,
                    events: tx,
                    write_in_flight: false,
                    peer_write_unacked: false,
                },
            );
            (local, rx)
        };

        debug!("Opening {} as {}", destination, LocalId(local));
        if let Err(e) = self.shared.send(Frame::open(local, destination)) {
            self.shared.close_stream(local);
            return Err(BridgeError::Link(e));
        }

        let reply = tokio::time::timeout(self.open_timeout, events.recv()).await;
        match reply {
            Ok(Some(StreamEvent::Ready { remote_id })) => Ok(LogicalStream::new(
                local,
                remote_id,
                destination.to_string(),
                Arc::clone(&self.shared),
                events,
            )),
            Ok(Some(StreamEvent::Closed)) => Err(BridgeError::Rejected {
                destination: destination.to_string(),
            }),
            Ok(Some(StreamEvent::Failed(e))) => Err(BridgeError::Link(e)),
            Ok(Some(other)) => Err(BridgeError::Link(MirrorError::ProtocolViolation(format!(
                "unexpected {:?} while opening {}",
                other,
                LocalId(local)
            )))),
            Ok(None) => Err(BridgeError::Link(MirrorError::Disconnected)),
            Err(_) => {
                self.shared.close_stream(local);
                Err(BridgeError::Timeout {
                    destination: destination.to_string(),
                    timeout: self.open_timeout,
                })
            }
        }
    }

    /// Accept streams opened by the device
    ///
    /// Until this is called, and once the receiver is dropped, device
    /// OPENs are refused.
    pub fn accept(&self) -> mpsc::UnboundedReceiver<LogicalStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.table().acceptor = Some(tx);
        rx
    }

    /// Close every stream and stop the I/O tasks
    ///
    /// Sends CLSE for each open stream and waits briefly for it to reach the
    /// device. Fails fast with `Disconnected` when the transport is already
    /// gone. The transport itself stays open; its owner releases it.
    pub async fn shutdown(&self) -> Result<(), MirrorError> {
        let was_open = self.shared.status.send_if_modified(|status| {
            if *status == LinkStatus::Open {
                *status = LinkStatus::Closed;
                true
            } else {
                false
            }
        });

        let result = if was_open {
            let slots: Vec<(u32, StreamSlot)> = {
                let mut table = self.shared.table();
                table.acceptor = None;
                let ids: Vec<u32> = table.slots.keys().copied().collect();
                table.retired.extend(ids);
                table.slots.drain().collect()
            };

            let mut closing = 0;
            for (local, slot) in slots {
                if let Some(remote) = slot.remote_id {
                    let _ = self
                        .shared
                        .outbound
                        .send(Outbound::Frame(Frame::close(local, remote)));
                    closing += 1;
                }
                let _ = slot.events.send(StreamEvent::Closed);
            }

            if self.shared.transport.is_open() {
                info!("Closing {} bridge streams", closing);
                let _ = self.shared.outbound.send(Outbound::Shutdown);
                let writer = self.take_task(&self.writer);
                if let Some(writer) = writer
                    && tokio::time::timeout(SHUTDOWN_FLUSH, writer).await.is_err()
                {
                    warn!("Timed out flushing stream closes");
                }
                Ok(())
            } else {
                warn!("Device already detached, skipping stream closes");
                Err(MirrorError::Disconnected)
            }
        } else {
            Ok(())
        };

        self.abort_tasks();
        result
    }

    /// Shut down and release the transport
    pub async fn close(&self) -> Result<(), MirrorError> {
        let result = self.shutdown().await;
        self.shared.transport.close();
        result
    }

    fn take_task(&self, slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
        slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn abort_tasks(&self) {
        for slot in [&self.reader, &self.writer] {
            if let Some(task) = self.take_task(slot) {
                task.abort();
            }
        }
    }
}

impl Drop for BridgeConnection {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn read_loop(shared: Arc<Shared>, mut decoder: FrameDecoder) {
    loop {
        let chunk = match shared.transport.read(READ_CHUNK).await {
            Ok(chunk) => chunk,
            Err(e) => {
                shared.fail(e.into());
                return;
            }
        };
        decoder.extend(&chunk);

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    debug!("<- {}", frame);
                    if let Err(e) = shared.dispatch(frame) {
                        shared.fail(e);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    shared.fail(e.into());
                    return;
                }
            }
        }
    }
}

async fn write_loop(shared: Arc<Shared>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = outbound.recv().await {
        let frame = match item {
            Outbound::Frame(frame) => frame,
            Outbound::Shutdown => return,
        };
        debug!("-> {}", frame);

        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                shared.fail(e.into());
                return;
            }
        };
        if let Err(e) = shared.transport.write(bytes).await {
            shared.fail(e.into());
            return;
        }
    }
}
