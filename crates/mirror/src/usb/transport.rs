//! Byte transport abstraction and its USB implementation

use crate::usb::device::UsbDevice;
use crate::usb::worker::spawn_usb_io;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use common::{DeviceInfo, TransportError, UsbBridge, UsbCommand, UsbEvent, create_usb_bridge};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ordered, reliable byte stream to one device
///
/// Read-call boundaries carry no meaning. `read` and `write` may be called
/// concurrently from different tasks; each direction has one user.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read up to `max_len` bytes, waiting until at least one is available
    async fn read(&self, max_len: usize) -> Result<Bytes, TransportError>;

    /// Write all of `data`, returning the number of bytes written
    async fn write(&self, data: Bytes) -> Result<usize, TransportError>;

    /// Release the device
    ///
    /// Idempotent. Always succeeds locally; pending reads fail with
    /// `Disconnected`. Errors from the physical close are only logged.
    fn close(&self);

    fn is_open(&self) -> bool;

    fn device(&self) -> &DeviceInfo;
}

/// Transport over the bulk endpoints of a claimed USB interface
pub struct UsbTransport {
    info: DeviceInfo,
    bridge: UsbBridge,
    pending: tokio::sync::Mutex<BytesMut>,
    open: AtomicBool,
}

impl UsbTransport {
    /// Claim the bridge interface of `device` and start its I/O thread
    pub fn open(mut device: UsbDevice, poll_timeout: Duration) -> Result<Self, TransportError> {
        let interface = device.open()?;
        let info = device.device_info();
        info!(
            "Opened {} (interface {}, IN {:#04x}, OUT {:#04x})",
            info, interface.number, interface.endpoint_in, interface.endpoint_out
        );

        let (bridge, worker) = create_usb_bridge();
        spawn_usb_io(device, interface, worker, poll_timeout).map_err(|e| {
            TransportError::Io(format!("Failed to spawn USB I/O thread: {}", e))
        })?;

        Ok(Self {
            info,
            bridge,
            pending: tokio::sync::Mutex::new(BytesMut::new()),
            open: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl Transport for UsbTransport {
    async fn read(&self, max_len: usize) -> Result<Bytes, TransportError> {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            let n = max_len.min(pending.len());
            return Ok(pending.split_to(n).freeze());
        }

        if !self.is_open() {
            return Err(TransportError::Disconnected);
        }

        match self.bridge.recv_event().await {
            Ok(UsbEvent::Data(data)) => {
                if data.len() <= max_len {
                    Ok(data)
                } else {
                    pending.extend_from_slice(&data[max_len..]);
                    Ok(data.slice(..max_len))
                }
            }
            Ok(UsbEvent::Failed(e)) => {
                warn!("USB transport failed: {}", e);
                self.open.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.open.store(false, Ordering::SeqCst);
                Err(TransportError::Disconnected)
            }
        }
    }

    async fn write(&self, data: Bytes) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Disconnected);
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.bridge
            .send_command(UsbCommand::Write { data, response: tx })
            .await
            .map_err(|_| TransportError::Disconnected)?;

        let result = rx.await.map_err(|_| TransportError::Disconnected)?;
        if matches!(result, Err(TransportError::Disconnected)) {
            self.open.store(false, Ordering::SeqCst);
        }
        result
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if self.bridge.is_closed() {
            return;
        }
        debug!("Closing USB transport for {}", self.info);
        // Shutdown stays readable after close; the I/O thread takes it on
        // its next poll and releases the interface.
        if !self.bridge.request_shutdown() {
            debug!("USB command queue full, relying on bridge closure");
        }
        self.bridge.close();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn device(&self) -> &DeviceInfo {
        &self.info
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.close();
    }
}
