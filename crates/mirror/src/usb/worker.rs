//! USB I/O thread
//!
//! One OS thread per open device performs the blocking bulk transfers.
//! The loop alternates between servicing write commands and polling the IN
//! endpoint with a short timeout, so writes wait at most one poll interval.
//! When the async side stops draining events, reading pauses instead of
//! buffering without bound.

use crate::usb::device::{BridgeInterface, UsbDevice};
use crate::usb::transfers::{read_bulk_chunk, write_bulk_all};
use bytes::Bytes;
use common::{TransportError, UsbCommand, UsbEvent, UsbWorker};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Size of one bulk IN read
pub const READ_CHUNK: usize = 64 * 1024;

/// I/O loop state for one device
pub struct UsbIoThread {
    device: UsbDevice,
    interface: BridgeInterface,
    worker: UsbWorker,
    poll_timeout: Duration,
    held: Option<UsbEvent>,
}

impl UsbIoThread {
    pub fn new(
        device: UsbDevice,
        interface: BridgeInterface,
        worker: UsbWorker,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            device,
            interface,
            worker,
            poll_timeout,
            held: None,
        }
    }

    /// Run until shutdown, bridge closure, or a device failure
    pub fn run(mut self) {
        info!("USB I/O thread started");
        let mut buffer = vec![0u8; READ_CHUNK];

        loop {
            match self.service_commands() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.report_failure(e);
                    break;
                }
            }

            if let Some(event) = self.held.take() {
                match self.worker.try_send_event(event) {
                    Ok(None) => {}
                    Ok(Some(event)) => {
                        self.held = Some(event);
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    Err(_) => break,
                }
            }

            let Some(handle) = self.device.handle() else {
                self.report_failure(TransportError::Disconnected);
                break;
            };

            match read_bulk_chunk(
                handle,
                self.interface.endpoint_in,
                &mut buffer,
                self.poll_timeout,
            ) {
                Ok(Some(0)) | Ok(None) => {}
                Ok(Some(len)) => {
                    self.held = Some(UsbEvent::Data(Bytes::copy_from_slice(&buffer[..len])));
                }
                Err(e) => {
                    self.report_failure(e);
                    break;
                }
            }
        }

        self.device.close();
        info!("USB I/O thread stopped");
    }

    /// Handle queued commands; `Ok(false)` means stop
    fn service_commands(&mut self) -> Result<bool, TransportError> {
        loop {
            let cmd = match self.worker.try_recv_command() {
                Ok(Some(cmd)) => cmd,
                Ok(None) => return Ok(true),
                Err(_) => {
                    debug!("USB bridge closed");
                    return Ok(false);
                }
            };

            match cmd {
                UsbCommand::Shutdown => {
                    info!("USB I/O thread shutting down");
                    return Ok(false);
                }
                UsbCommand::Write { data, response } => {
                    let result = match self.device.handle() {
                        Some(handle) => write_bulk_all(
                            handle,
                            self.interface.endpoint_out,
                            &data,
                            self.interface.max_packet_size,
                        ),
                        None => Err(TransportError::Disconnected),
                    };
                    let failure = result.as_ref().err().cloned();
                    let _ = response.send(result);
                    if let Some(e) = failure {
                        return Err(e);
                    }
                }
            }
        }
    }

    fn report_failure(&self, error: TransportError) {
        warn!("USB device failed: {}", error);
        let _ = self.worker.try_send_event(UsbEvent::Failed(error));
    }
}

/// Spawn the I/O thread for an opened device
pub fn spawn_usb_io(
    device: UsbDevice,
    interface: BridgeInterface,
    worker: UsbWorker,
    poll_timeout: Duration,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-io".to_string())
        .spawn(move || UsbIoThread::new(device, interface, worker, poll_timeout).run())
}
