//! Logical streams multiplexed over a bridge connection

use crate::bridge::BridgeError;
use crate::bridge::engine::{Shared, StreamEvent};
use bytes::Bytes;
use common::MirrorError;
use protocol::{Frame, LocalId, RemoteId};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Open,
    /// Closed locally, CLSE sent
    Closing,
    /// Closed by the device or by a link failure
    Closed,
}

/// One bidirectional byte stream to a device service
///
/// Writes are chunked to the negotiated payload size and each chunk waits
/// for the device's OKAY before the next is sent. Data the device writes is
/// acknowledged as it is read.
pub struct LogicalStream {
    local_id: u32,
    remote_id: u32,
    destination: String,
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    unread: VecDeque<Bytes>,
    state: StreamState,
    failure: Option<MirrorError>,
}

impl LogicalStream {
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        destination: String,
        shared: Arc<Shared>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            destination,
            shared,
            events,
            unread: VecDeque::new(),
            state: StreamState::Open,
            failure: None,
        }
    }

    pub fn local_id(&self) -> LocalId {
        LocalId(self.local_id)
    }

    pub fn remote_id(&self) -> RemoteId {
        RemoteId(self.remote_id)
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Next chunk written by the device, `None` once the stream is closed
    ///
    /// Chunk boundaries follow the device's WRTE frames.
    pub async fn read(&mut self) -> Result<Option<Bytes>, BridgeError> {
        if let Some(data) = self.unread.pop_front() {
            self.shared.ack_peer_write(self.local_id);
            return Ok(Some(data));
        }

        loop {
            if let Some(e) = &self.failure {
                return Err(BridgeError::Link(e.clone()));
            }
            if self.state != StreamState::Open {
                return Ok(None);
            }

            let Some(event) = self.events.recv().await else {
                self.state = StreamState::Closed;
                return Ok(None);
            };
            match event {
                StreamEvent::Data(data) => {
                    self.shared.ack_peer_write(self.local_id);
                    return Ok(Some(data));
                }
                other => self.apply(other),
            }
        }
    }

    /// Write all of `data`, waiting for the device to accept each chunk
    pub async fn write(&mut self, data: &[u8]) -> Result<(), BridgeError> {
        for chunk in data.chunks(self.shared.max_payload.max(1)) {
            if let Some(e) = &self.failure {
                return Err(BridgeError::Link(e.clone()));
            }
            if self.state != StreamState::Open {
                return Err(BridgeError::StreamNotOpen);
            }

            let remote = self.shared.begin_write(self.local_id)?;
            self.shared.send(Frame::write(
                self.local_id,
                remote,
                Bytes::copy_from_slice(chunk),
            ))?;
            self.wait_for_ack().await?;
        }
        Ok(())
    }

    async fn wait_for_ack(&mut self) -> Result<(), BridgeError> {
        loop {
            let Some(event) = self.events.recv().await else {
                self.state = StreamState::Closed;
                return Err(BridgeError::StreamNotOpen);
            };
            match event {
                StreamEvent::Acked => return Ok(()),
                // Device output interleaved with our write; keep it for read()
                StreamEvent::Data(data) => self.unread.push_back(data),
                other => {
                    self.apply(other);
                    if let Some(e) = &self.failure {
                        return Err(BridgeError::Link(e.clone()));
                    }
                    if self.state != StreamState::Open {
                        return Err(BridgeError::StreamNotOpen);
                    }
                }
            }
        }
    }

    fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Closed => {
                debug!("{} closed by device", self.destination);
                self.state = StreamState::Closed;
            }
            StreamEvent::Failed(e) => {
                self.state = StreamState::Closed;
                self.failure = Some(e);
            }
            StreamEvent::Ready { .. } | StreamEvent::Acked | StreamEvent::Data(_) => {}
        }
    }

    /// Close the stream; further reads return `None`
    pub fn close(&mut self) {
        if self.state == StreamState::Open {
            self.state = StreamState::Closing;
            self.shared.close_stream(self.local_id);
        }
    }
}

impl std::fmt::Debug for LogicalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalStream")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("destination", &self.destination)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for LogicalStream {
    fn drop(&mut self) {
        self.close();
    }
}
