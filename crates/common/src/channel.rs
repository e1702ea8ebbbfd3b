//! Async channel bridge between Tokio runtime and the USB I/O thread
//!
//! Bulk transfers through `rusb` block, so they run on a dedicated thread.
//! The async side submits writes as commands and receives inbound bytes as
//! events. Both directions are bounded: when the event channel is full the
//! worker stops reading from the device until the async side catches up.

use crate::TransportError;
use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use bytes::Bytes;

/// Capacity of each direction of the bridge
pub const BRIDGE_CAPACITY: usize = 256;

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// Write bytes to the bulk OUT endpoint
    Write {
        data: Bytes,
        /// Channel to send the number of bytes written back
        response: tokio::sync::oneshot::Sender<Result<usize, TransportError>>,
    },

    /// Release the interface and stop the USB thread
    Shutdown,
}

/// Events from the USB thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    /// Bytes read from the bulk IN endpoint
    Data(Bytes),

    /// The device failed; no further events follow
    Failed(TransportError),
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| crate::MirrorError::Disconnected)
    }

    /// Receive an event from the USB thread
    ///
    /// Fails with `Disconnected` once the worker is gone and the queue is
    /// drained.
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|_| crate::MirrorError::Disconnected)
    }

    /// Queue a `Shutdown` without waiting
    ///
    /// Returns `false` when the command queue is full or already closed.
    pub fn request_shutdown(&self) -> bool {
        self.cmd_tx.try_send(UsbCommand::Shutdown).is_ok()
    }

    /// Close both directions; pending `recv_event` calls return immediately
    pub fn close(&self) {
        self.cmd_tx.close();
        self.event_rx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    cmd_rx: Receiver<UsbCommand>,
    event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Try to receive a command without blocking
    ///
    /// `Err` means the async side has gone away.
    pub fn try_recv_command(&self) -> crate::Result<Option<UsbCommand>> {
        match self.cmd_rx.try_recv() {
            Ok(cmd) => Ok(Some(cmd)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(crate::MirrorError::Disconnected),
        }
    }

    /// Offer an event without blocking
    ///
    /// Returns the event back when the channel is full so the caller can
    /// retry after servicing commands.
    pub fn try_send_event(&self, event: UsbEvent) -> crate::Result<Option<UsbEvent>> {
        match self.event_tx.try_send(event) {
            Ok(()) => Ok(None),
            Err(TrySendError::Full(event)) => Ok(Some(event)),
            Err(TrySendError::Closed(_)) => Err(crate::MirrorError::Disconnected),
        }
    }

    /// Whether the async side has closed the bridge
    pub fn is_closed(&self) -> bool {
        self.cmd_rx.is_closed()
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(BRIDGE_CAPACITY);
    let (event_tx, event_rx) = bounded(BRIDGE_CAPACITY);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}
