//! USB Bridge Integration Tests
//!
//! Tests for the async channel bridge between Tokio runtime and the USB I/O
//! thread.
//!
//! # Test Scenarios
//! - Write commands answered from a worker thread
//! - Inbound data delivered in order
//! - Backpressure when the async side stops reading
//! - Shutdown and close propagation
//!
//! Run with: `cargo test -p common --test usb_bridge_tests`

use bytes::Bytes;
use common::{MirrorError, TransportError, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll for the next command the way the I/O thread does; `None` once closed
fn next_command(worker: &UsbWorker) -> Option<UsbCommand> {
    loop {
        match worker.try_recv_command() {
            Ok(Some(cmd)) => return Some(cmd),
            Ok(None) => thread::sleep(Duration::from_millis(1)),
            Err(_) => return None,
        }
    }
}

/// Retry a full event channel until the event is taken
fn push_event(worker: &UsbWorker, mut event: UsbEvent) {
    while let Some(held) = worker.try_send_event(event).unwrap() {
        event = held;
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Command Flow Tests
// ============================================================================

#[tokio::test]
async fn test_write_command_round_trip() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        while let Some(cmd) = next_command(&worker) {
            match cmd {
                UsbCommand::Write { data, response } => {
                    let _ = response.send(Ok(data.len()));
                }
                UsbCommand::Shutdown => break,
            }
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::Write {
            data: Bytes::from_static(b"CNXN"),
            response: tx,
        })
        .await
        .expect("Failed to send command");

    let written = tokio::time::timeout(TEST_TIMEOUT, rx)
        .await
        .expect("Timed out")
        .expect("Worker dropped response");
    assert_eq!(written, Ok(4));

    bridge.send_command(UsbCommand::Shutdown).await.unwrap();
    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_write_failure_reported() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        if let Some(UsbCommand::Write { response, .. }) = next_command(&worker) {
            let _ = response.send(Err(TransportError::Disconnected));
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::Write {
            data: Bytes::from_static(b"x"),
            response: tx,
        })
        .await
        .unwrap();

    assert_eq!(rx.await.unwrap(), Err(TransportError::Disconnected));
    handle.join().expect("Worker thread panicked");
}

// ============================================================================
// Event Flow Tests
// ============================================================================

#[tokio::test]
async fn test_data_events_arrive_in_order() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        for i in 0..100u8 {
            push_event(&worker, UsbEvent::Data(Bytes::from(vec![i])));
        }
        push_event(&worker, UsbEvent::Failed(TransportError::Disconnected));
    });

    for i in 0..100u8 {
        let event = bridge.recv_event().await.unwrap();
        assert_eq!(event, UsbEvent::Data(Bytes::from(vec![i])));
    }
    assert_eq!(
        bridge.recv_event().await.unwrap(),
        UsbEvent::Failed(TransportError::Disconnected)
    );

    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_backpressure_holds_events() {
    let (bridge, worker) = create_usb_bridge();

    let mut held = None;
    let mut sent = 0;
    while held.is_none() {
        held = worker
            .try_send_event(UsbEvent::Data(Bytes::from_static(b"frame")))
            .unwrap();
        if held.is_none() {
            sent += 1;
        }
    }
    assert_eq!(sent, common::channel::BRIDGE_CAPACITY);

    // Draining one slot makes room for the held event
    bridge.recv_event().await.unwrap();
    let event = held.take().unwrap();
    assert_eq!(worker.try_send_event(event).unwrap(), None);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_worker_exit_disconnects_bridge() {
    let (bridge, worker) = create_usb_bridge();
    drop(worker);

    assert_eq!(bridge.recv_event().await, Err(MirrorError::Disconnected));
    assert_eq!(
        bridge.send_command(UsbCommand::Shutdown).await,
        Err(MirrorError::Disconnected)
    );
}

#[tokio::test]
async fn test_close_unblocks_pending_receive() {
    let (bridge, _worker) = create_usb_bridge();

    let receiver = bridge.clone();
    let pending = tokio::spawn(async move { receiver.recv_event().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    bridge.close();

    let result = tokio::time::timeout(TEST_TIMEOUT, pending)
        .await
        .expect("Close did not unblock the receiver")
        .unwrap();
    assert_eq!(result, Err(MirrorError::Disconnected));
    assert!(bridge.is_closed());
}
