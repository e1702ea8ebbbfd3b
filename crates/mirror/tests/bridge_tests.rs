//! Bridge engine tests
//!
//! Drive the handshake and stream multiplexer against an in-memory device.
//!
//! Run with: `cargo test -p mirror --test bridge_tests`

use bytes::Bytes;
use common::MirrorError;
use mirror::bridge::{
    BridgeConnection, BridgeError, BridgeOptions, HandshakeProgress, LinkStatus, LogicalStream,
    StreamState,
};
use mirror::test_utils::{
    AuthBehavior, DEFAULT_TEST_TIMEOUT, DevicePeer, FakeDevice, FakeDeviceConfig,
    memory_transport, test_host_key, with_timeout,
};
use mirror::usb::Transport;
use protocol::{Command, Frame, encode_frame};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEVICE_VERSION: u32 = 0x0100_0001;
const BANNER: &str = "device::ro.product.model=Pixel 7;features=shell_v2,cmd";

fn no_progress(_: HandshakeProgress) {}

/// Answer the host CNXN by hand and return the connection
async fn connect_manual(
    peer: &mut DevicePeer,
    transport: Arc<dyn Transport>,
    options: &BridgeOptions,
    device_max_payload: u32,
) -> BridgeConnection {
    let device = async {
        let hello = peer.next_frame().await.expect("host CNXN");
        assert_eq!(hello.command, Command::Cnxn);
        peer.send_frame(&Frame::connect(DEVICE_VERSION, device_max_payload, BANNER));
    };
    let (connection, ()) = tokio::join!(
        BridgeConnection::connect(transport, test_host_key(), options, &no_progress),
        device
    );
    connection.expect("handshake")
}

/// Open `destination` and have the device accept it as `remote`
async fn open_manual(
    connection: &BridgeConnection,
    peer: &mut DevicePeer,
    destination: &str,
    remote: u32,
) -> LogicalStream {
    let device = async {
        let open = peer.next_frame().await.expect("host OPEN");
        assert_eq!(open.command, Command::Open);
        assert_eq!(open.payload_str(), destination);
        peer.send_frame(&Frame::okay(remote, open.arg0));
    };
    let (stream, ()) = tokio::join!(connection.open(destination), device);
    stream.expect("open")
}

async fn connect_fake(
    config: FakeDeviceConfig,
    options: BridgeOptions,
) -> (
    Result<BridgeConnection, MirrorError>,
    Vec<HandshakeProgress>,
    mirror::test_utils::DeviceLog,
) {
    let (transport, peer, _closes) = memory_transport();
    let device = FakeDevice::new(config, peer);
    let log = device.log();
    device.spawn();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = {
        let seen = Arc::clone(&seen);
        move |step: HandshakeProgress| seen.lock().unwrap().push(step)
    };
    let connection =
        BridgeConnection::connect(Arc::new(transport), test_host_key(), &options, &record).await;
    let steps = seen.lock().unwrap().clone();
    let log = log.lock().unwrap().clone();
    (connection, steps, log)
}

// ============================================================================
// Handshake
// ============================================================================

mod handshake_tests {
    use super::*;

    #[tokio::test]
    async fn test_trusted_device_connects_without_auth() {
        let (connection, steps, log) =
            connect_fake(FakeDeviceConfig::default(), BridgeOptions::default()).await;
        let connection = connection.unwrap();

        assert!(steps.is_empty());
        assert_eq!(log.signatures, 0);
        assert!(connection.banner().has_feature("shell_v2"));
        assert_eq!(connection.banner().model(), Some("Pixel 7"));
        assert_eq!(connection.status(), LinkStatus::Open);
    }

    #[tokio::test]
    async fn test_known_key_signs_once() {
        let config = FakeDeviceConfig {
            auth: AuthBehavior::KnownKey,
            ..Default::default()
        };
        let (connection, steps, log) = connect_fake(config, BridgeOptions::default()).await;

        assert!(connection.is_ok());
        assert_eq!(steps, vec![HandshakeProgress::AuthChallenge]);
        assert_eq!(log.signatures, 1);
        assert_eq!(log.public_keys, 0);
    }

    #[tokio::test]
    async fn test_unknown_key_offers_public_key() {
        let config = FakeDeviceConfig {
            auth: AuthBehavior::ApproveNewKey,
            ..Default::default()
        };
        let (connection, steps, log) = connect_fake(config, BridgeOptions::default()).await;

        assert!(connection.is_ok());
        assert_eq!(
            steps,
            vec![
                HandshakeProgress::AuthChallenge,
                HandshakeProgress::SignatureRejected,
                HandshakeProgress::AwaitingUserApproval,
            ]
        );
        assert_eq!(log.signatures, 1);
        assert_eq!(log.public_keys, 1);
    }

    #[tokio::test]
    async fn test_unapproved_key_times_out_unauthorized() {
        let config = FakeDeviceConfig {
            auth: AuthBehavior::NeverApprove,
            ..Default::default()
        };
        let options = BridgeOptions {
            auth_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (connection, _, _) = connect_fake(config, options).await;

        assert!(matches!(connection, Err(MirrorError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_silent_device_is_io_error() {
        let config = FakeDeviceConfig {
            auth: AuthBehavior::Silent,
            ..Default::default()
        };
        let options = BridgeOptions {
            handshake_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (connection, _, _) = connect_fake(config, options).await;

        assert!(matches!(connection, Err(MirrorError::Io(_))));
    }

    #[tokio::test]
    async fn test_payload_limit_is_negotiated_down() {
        let config = FakeDeviceConfig {
            max_payload: 4096,
            ..Default::default()
        };
        let (connection, _, _) = connect_fake(config, BridgeOptions::default()).await;

        assert_eq!(connection.unwrap().max_payload(), 4096);
    }

    #[tokio::test]
    async fn test_legacy_zero_payload_means_4k() {
        let (transport, mut peer, _) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 0).await;
        assert_eq!(connection.max_payload(), 4096);
    }
}

// ============================================================================
// Streams
// ============================================================================

mod stream_tests {
    use super::*;

    #[tokio::test]
    async fn test_rejected_open() {
        let (transport, mut peer, _) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;

        let device = async {
            let open = peer.next_frame().await.unwrap();
            peer.send_frame(&Frame::close(0, open.arg0));
        };
        let (result, ()) = tokio::join!(connection.open("localabstract:missing"), device);

        assert!(matches!(result, Err(BridgeError::Rejected { .. })));
        assert_eq!(connection.status(), LinkStatus::Open);
    }

    #[tokio::test]
    async fn test_late_okay_after_open_timeout_is_closed() {
        let (transport, mut peer, _) = memory_transport();
        let options = BridgeOptions {
            open_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let connection = connect_manual(&mut peer, Arc::new(transport), &options, 4096).await;

        let result = connection.open("shell:sleep").await;
        assert!(matches!(result, Err(BridgeError::Timeout { .. })));

        let open = peer.next_frame().await.unwrap();
        peer.send_frame(&Frame::okay(9, open.arg0));

        // The device is told to drop its half of the abandoned stream
        let reply = with_timeout(DEFAULT_TEST_TIMEOUT, peer.next_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Frame::close(open.arg0, 9));

        // A repeated OKAY is only dropped
        peer.send_frame(&Frame::okay(9, open.arg0));

        let stream = open_manual(&connection, &mut peer, "shell:true", 10).await;
        assert_eq!(stream.remote_id().0, 10);
        assert_eq!(connection.status(), LinkStatus::Open);
    }

    #[tokio::test]
    async fn test_read_acknowledges_device_write() {
        let (transport, mut peer, _) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;
        let mut stream = open_manual(&connection, &mut peer, "shell:echo", 7).await;
        let local = stream.local_id().0;

        peer.send_frame(&Frame::write(7, local, Bytes::from_static(b"hello")));
        let data = stream.read().await.unwrap().unwrap();
        assert_eq!(&data[..], b"hello");

        let ack = peer.next_frame().await.unwrap();
        assert_eq!(ack, Frame::okay(local, 7));
    }

    #[tokio::test]
    async fn test_device_close_ends_reads() {
        let (transport, mut peer, _) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;
        let mut stream = open_manual(&connection, &mut peer, "shell:true", 7).await;
        let local = stream.local_id().0;

        peer.send_frame(&Frame::write(7, local, Bytes::from_static(b"bye")));
        peer.send_frame(&Frame::close(7, local));

        assert_eq!(&stream.read().await.unwrap().unwrap()[..], b"bye");
        assert_eq!(stream.read().await.unwrap(), None);
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(matches!(
            stream.write(b"more").await,
            Err(BridgeError::StreamNotOpen)
        ));
    }

    #[tokio::test]
    async fn test_second_unacked_write_is_violation() {
        let (transport, mut peer, closes) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;
        let mut stream = open_manual(&connection, &mut peer, "shell:cat", 7).await;
        let local = stream.local_id().0;

        peer.send_frame(&Frame::write(7, local, Bytes::from_static(b"one")));
        peer.send_frame(&Frame::write(7, local, Bytes::from_static(b"two")));

        let status = with_timeout(DEFAULT_TEST_TIMEOUT, connection.closed())
            .await
            .unwrap();
        assert!(matches!(
            status,
            LinkStatus::Failed(MirrorError::ProtocolViolation(_))
        ));
        assert_eq!(closes.count(), 1);

        // Data delivered before the fault is still readable, then the error
        assert_eq!(&stream.read().await.unwrap().unwrap()[..], b"one");
        assert!(matches!(
            stream.read().await,
            Err(BridgeError::Link(MirrorError::ProtocolViolation(_)))
        ));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_connection() {
        let (transport, mut peer, closes) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;
        let mut stream = open_manual(&connection, &mut peer, "shell:cat", 7).await;
        let local = stream.local_id().0;

        let mut corrupt =
            encode_frame(&Frame::write(7, local, Bytes::from_static(b"payload"))).unwrap().to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;
        peer.send_raw(corrupt);

        let status = with_timeout(DEFAULT_TEST_TIMEOUT, connection.closed())
            .await
            .unwrap();
        assert!(matches!(
            status,
            LinkStatus::Failed(MirrorError::ProtocolViolation(_))
        ));
        assert!(matches!(
            stream.read().await,
            Err(BridgeError::Link(MirrorError::ProtocolViolation(_)))
        ));
        assert_eq!(closes.count(), 1);
    }

    #[tokio::test]
    async fn test_payload_above_negotiated_size_fails_connection() {
        let (transport, mut peer, closes) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;
        let mut stream = open_manual(&connection, &mut peer, "shell:cat", 7).await;
        let local = stream.local_id().0;

        peer.send_frame(&Frame::write(7, local, Bytes::from(vec![0u8; 4097])));

        let status = with_timeout(DEFAULT_TEST_TIMEOUT, connection.closed())
            .await
            .unwrap();
        assert!(matches!(
            status,
            LinkStatus::Failed(MirrorError::ProtocolViolation(_))
        ));
        assert!(stream.read().await.is_err());
        assert_eq!(closes.count(), 1);
    }

    #[tokio::test]
    async fn test_frame_for_unknown_stream_is_violation() {
        let (transport, mut peer, _) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;

        peer.send_frame(&Frame::write(3, 42, Bytes::from_static(b"?")));

        let status = with_timeout(DEFAULT_TEST_TIMEOUT, connection.closed())
            .await
            .unwrap();
        assert!(matches!(
            status,
            LinkStatus::Failed(MirrorError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_device_open_refused_without_acceptor() {
        let (transport, mut peer, _) = memory_transport();
        let _connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;

        peer.send_frame(&Frame::open(50, "localabstract:scrcpy_1"));
        let reply = peer.next_frame().await.unwrap();
        assert_eq!(reply, Frame::close(0, 50));
    }

    #[tokio::test]
    async fn test_device_open_accepted() {
        let (transport, mut peer, _) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;
        let mut acceptor = connection.accept();

        peer.send_frame(&Frame::open(50, "localabstract:scrcpy_1"));
        let reply = peer.next_frame().await.unwrap();
        assert_eq!(reply.command, Command::Okay);
        assert_eq!(reply.arg1, 50);

        let stream = acceptor.recv().await.unwrap();
        assert_eq!(stream.remote_id().0, 50);
        assert_eq!(stream.local_id().0, reply.arg0);
        assert_eq!(stream.destination(), "localabstract:scrcpy_1");
    }

    #[tokio::test]
    async fn test_shutdown_closes_streams_but_not_transport() {
        let (transport, mut peer, closes) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;
        let first = open_manual(&connection, &mut peer, "shell:a", 7).await;
        let second = open_manual(&connection, &mut peer, "shell:b", 8).await;

        connection.shutdown().await.unwrap();

        let mut closed = vec![
            peer.next_frame().await.unwrap(),
            peer.next_frame().await.unwrap(),
        ];
        closed.sort_by_key(|f| f.arg0);
        assert_eq!(
            closed,
            vec![
                Frame::close(first.local_id().0, 7),
                Frame::close(second.local_id().0, 8),
            ]
        );
        assert_eq!(closes.count(), 0);
        assert_eq!(connection.status(), LinkStatus::Closed);

        connection.close().await.unwrap();
        connection.close().await.unwrap();
        assert_eq!(closes.count(), 1);
    }

    #[tokio::test]
    async fn test_unplug_fails_link_and_later_opens() {
        let (transport, mut peer, closes) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;

        peer.detach();

        let status = with_timeout(DEFAULT_TEST_TIMEOUT, connection.closed())
            .await
            .unwrap();
        assert_eq!(status, LinkStatus::Failed(MirrorError::Disconnected));
        assert!(matches!(
            connection.open("shell:true").await,
            Err(BridgeError::Link(MirrorError::Disconnected))
        ));
        assert!(matches!(
            connection.shutdown().await,
            Ok(()) | Err(MirrorError::Disconnected)
        ));
        assert_eq!(closes.count(), 1);
    }
}

// ============================================================================
// Flow control properties
// ============================================================================

mod flow_control_tests {
    use super::*;
    use proptest::prelude::*;

    /// Device side of one write: every chunk fits the payload limit and no
    /// second WRTE shows up until the previous one is acknowledged
    async fn receive_write(
        peer: &mut DevicePeer,
        remote: u32,
        expected_len: usize,
        max_payload: usize,
    ) -> Vec<u8> {
        let mut received = Vec::new();
        while received.len() < expected_len {
            let frame = peer.next_frame().await.expect("WRTE");
            assert_eq!(frame.command, Command::Wrte);
            assert!(frame.payload.len() <= max_payload);
            assert!(!frame.payload.is_empty());
            received.extend_from_slice(&frame.payload);

            let early = tokio::time::timeout(Duration::from_millis(5), peer.next_frame()).await;
            assert!(early.is_err(), "host sent data before OKAY");
            peer.send_frame(&Frame::okay(remote, frame.arg0));
        }
        received
    }

    /// What the host saw for a stream whose data and OKAY arrived in a
    /// given order
    struct OpenOutcome {
        opened: bool,
        first_read: Option<Vec<u8>>,
        status: LinkStatus,
    }

    /// Device answers the host OPEN with `chunks` as WRTEs and the OKAY
    /// slotted in before chunk `okay_at`
    async fn open_with_arrival_order(chunks: &[Vec<u8>], okay_at: usize) -> OpenOutcome {
        let (transport, mut peer, _) = memory_transport();
        let connection =
            connect_manual(&mut peer, Arc::new(transport), &BridgeOptions::default(), 4096).await;

        let device = async {
            let open = peer.next_frame().await.expect("host OPEN");
            let local = open.arg0;
            for (i, chunk) in chunks.iter().enumerate() {
                if i == okay_at {
                    peer.send_frame(&Frame::okay(7, local));
                }
                peer.send_frame(&Frame::write(7, local, Bytes::copy_from_slice(chunk)));
            }
            if okay_at >= chunks.len() {
                peer.send_frame(&Frame::okay(7, local));
            }
        };
        let (opened, ()) = tokio::join!(connection.open("shell:cat"), device);

        let (opened, first_read) = match opened {
            Ok(mut stream) => {
                let first = with_timeout(DEFAULT_TEST_TIMEOUT, stream.read())
                    .await
                    .expect("first read");
                (true, first.ok().flatten().map(|data| data.to_vec()))
            }
            Err(BridgeError::Link(MirrorError::ProtocolViolation(_))) => (false, None),
            Err(e) => panic!("unexpected open result: {:?}", e),
        };

        let status = if okay_at == 0 && chunks.len() == 1 {
            connection.status()
        } else {
            with_timeout(DEFAULT_TEST_TIMEOUT, connection.closed())
                .await
                .expect("link failure")
        };
        OpenOutcome {
            opened,
            first_read,
            status,
        }
    }

    #[tokio::test]
    async fn test_device_write_before_okay_fails_open() {
        let outcome = open_with_arrival_order(&[b"early".to_vec()], 1).await;
        assert!(!outcome.opened);
        assert!(outcome.first_read.is_none());
        assert!(matches!(
            outcome.status,
            LinkStatus::Failed(MirrorError::ProtocolViolation(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_device_data_never_precedes_open_answer(
            chunks in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 1..64),
                1..4,
            ),
            okay_at in 0usize..4,
        ) {
            let okay_at = okay_at.min(chunks.len());
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let outcome = runtime.block_on(open_with_arrival_order(&chunks, okay_at));

            if okay_at == 0 {
                // Answered first: the first chunk is the first thing read
                prop_assert!(outcome.opened);
                prop_assert_eq!(outcome.first_read, Some(chunks[0].clone()));
                if chunks.len() == 1 {
                    prop_assert_eq!(outcome.status, LinkStatus::Open);
                } else {
                    // Further chunks arrived before our OKAY for the first
                    prop_assert!(matches!(
                        outcome.status,
                        LinkStatus::Failed(MirrorError::ProtocolViolation(_))
                    ));
                }
            } else {
                prop_assert!(!outcome.opened);
                prop_assert!(outcome.first_read.is_none());
                prop_assert!(matches!(
                    outcome.status,
                    LinkStatus::Failed(MirrorError::ProtocolViolation(_))
                ));
            }
        }

        #[test]
        fn prop_writes_wait_for_ack(
            data in proptest::collection::vec(any::<u8>(), 0..1500),
            max_payload in 64u32..512,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let received = runtime.block_on(async {
                let (transport, mut peer, _) = memory_transport();
                let connection = connect_manual(
                    &mut peer,
                    Arc::new(transport),
                    &BridgeOptions::default(),
                    max_payload,
                )
                .await;
                let mut stream = open_manual(&connection, &mut peer, "shell:cat", 7).await;

                let (written, received) = tokio::join!(
                    stream.write(&data),
                    receive_write(&mut peer, 7, data.len(), max_payload as usize)
                );
                written.unwrap();
                received
            });
            prop_assert_eq!(received, data);
        }
    }
}
