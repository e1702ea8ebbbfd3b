//! Launches the capture service and sets up its tunnel

use crate::bridge::{BridgeConnection, BridgeError, LogicalStream};
use crate::capture::params::{CaptureParams, ServiceInstall, TunnelMode, new_scid, socket_name};
use crate::capture::push::push_service;
use crate::capture::tunnel::{InlineChannels, OutputSink, ServiceMonitor, TunnelReader};
use bytes::BytesMut;
use common::MirrorError;
use protocol::capture::{CODEC_META_LEN, DEVICE_NAME_LEN, parse_device_name};
use protocol::{CodecMeta, VideoCodec};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info};

/// Delay between attempts to reach the service socket
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Video stream properties announced by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMeta {
    pub device_name: String,
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// Packets carry a 12-byte header (otherwise raw Annex B)
    pub framed: bool,
}

/// A running capture service with its channels
pub struct CaptureTunnel {
    pub control: TunnelReader,
    pub video: TunnelReader,
    pub service: ServiceMonitor,
    pub meta: VideoMeta,
}

/// Starts the capture service over an established bridge connection
pub struct CaptureClient<'a> {
    connection: &'a BridgeConnection,
    params: &'a CaptureParams,
    on_output: OutputSink,
}

impl<'a> CaptureClient<'a> {
    pub fn new(
        connection: &'a BridgeConnection,
        params: &'a CaptureParams,
        on_output: OutputSink,
    ) -> Self {
        Self {
            connection,
            params,
            on_output,
        }
    }

    /// Install (if needed) and launch the service, then read the video preamble
    ///
    /// Any failure leaves nothing running: streams opened so far are closed
    /// when dropped.
    pub async fn start(&self) -> Result<CaptureTunnel, MirrorError> {
        if let ServiceInstall::Push { local, remote_path } = &self.params.install {
            push_service(self.connection, local, remote_path).await?;
        }

        let scid = new_scid();
        let socket = socket_name(&scid);
        debug!("Capture session id {}", scid);

        let mut acceptor = match self.params.tunnel {
            TunnelMode::Reverse => {
                self.setup_reverse(&socket).await?;
                Some(self.connection.accept())
            }
            _ => None,
        };

        let shell_v2 = self.connection.banner().has_feature("shell_v2");
        let prefix = if shell_v2 { "shell,v2,raw:" } else { "shell:" };
        let destination = format!("{}{}", prefix, self.params.service_command(&scid));
        info!(
            "Launching capture service {} ({} tunnel)",
            self.params.server_version,
            self.params.tunnel.name()
        );
        let launch = self.connection.open(&destination).await?;
        let deadline = Instant::now() + self.params.startup_timeout;

        let (service, control, mut video) = match self.params.tunnel {
            TunnelMode::Inline => {
                let (channels, control, video) = InlineChannels::new();
                let service =
                    ServiceMonitor::spawn(launch, shell_v2, Some(channels), self.on_output.clone());
                (service, control, video)
            }
            TunnelMode::Forward => {
                let service = ServiceMonitor::spawn(launch, shell_v2, None, self.on_output.clone());
                let video = within(deadline, &service, "video socket", self.connect_forward(&socket))
                    .await?;
                let control =
                    within(deadline, &service, "control socket", self.connect_forward(&socket))
                        .await?;
                (
                    service,
                    TunnelReader::from_stream(control),
                    TunnelReader::from_stream(video),
                )
            }
            TunnelMode::Reverse => {
                let service = ServiceMonitor::spawn(launch, shell_v2, None, self.on_output.clone());
                let acceptor = acceptor.as_mut().ok_or(MirrorError::Disconnected)?;
                let video = within(deadline, &service, "video socket", accept_one(acceptor)).await?;
                let control =
                    within(deadline, &service, "control socket", accept_one(acceptor)).await?;
                (
                    service,
                    TunnelReader::from_stream(control),
                    TunnelReader::from_stream(video),
                )
            }
        };
        // Further device OPENs are refused
        drop(acceptor);

        let meta = within(
            deadline,
            &service,
            "video stream",
            read_preamble(&mut video, self.params),
        )
        .await?;
        info!(
            "Capturing {} at {}x{} ({})",
            meta.device_name, meta.width, meta.height, meta.codec
        );

        Ok(CaptureTunnel {
            control,
            video,
            service,
            meta,
        })
    }

    /// Ask the device to connect the service socket back to the host
    async fn setup_reverse(&self, socket: &str) -> Result<(), MirrorError> {
        let destination = format!(
            "reverse:forward:localabstract:{};localabstract:{}",
            socket, socket
        );
        let mut stream = self.connection.open(&destination).await?;
        let mut reply = BytesMut::new();
        while reply.len() < 4 {
            match stream.read().await? {
                Some(data) => reply.extend_from_slice(&data),
                None => break,
            }
        }
        stream.close();

        if reply.starts_with(b"OKAY") {
            Ok(())
        } else {
            let message = reply.get(8..).unwrap_or_default();
            Err(MirrorError::CaptureServiceUnavailable(format!(
                "reverse tunnel refused: {}",
                String::from_utf8_lossy(message)
            )))
        }
    }

    /// Open the service socket, retrying while the service starts up
    async fn connect_forward(&self, socket: &str) -> Result<LogicalStream, MirrorError> {
        let destination = format!("localabstract:{}", socket);
        loop {
            match self.connection.open(&destination).await {
                Ok(stream) => return Ok(stream),
                Err(BridgeError::Rejected { .. }) => {
                    debug!("{} not listening yet", destination);
                    sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

async fn accept_one(
    acceptor: &mut mpsc::UnboundedReceiver<LogicalStream>,
) -> Result<LogicalStream, MirrorError> {
    acceptor.recv().await.ok_or(MirrorError::Disconnected)
}

/// Run `step`, failing if the service dies or the startup deadline passes
async fn within<T>(
    deadline: Instant,
    service: &ServiceMonitor,
    what: &str,
    step: impl Future<Output = Result<T, MirrorError>>,
) -> Result<T, MirrorError> {
    tokio::select! {
        result = timeout_at(deadline, step) => match result {
            Ok(result) => result,
            Err(_) => Err(MirrorError::CaptureServiceUnavailable(format!(
                "no {} from the capture service before the startup deadline",
                what
            ))),
        },
        error = service.failed() => Err(error),
    }
}

async fn read_preamble(
    video: &mut TunnelReader,
    params: &CaptureParams,
) -> Result<VideoMeta, MirrorError> {
    let ended = || {
        MirrorError::CaptureServiceUnavailable(
            "video stream ended before its preamble".to_string(),
        )
    };

    if params.tunnel == TunnelMode::Forward {
        video.read_exact(1).await?.ok_or_else(ended)?;
    }
    let name = video.read_exact(DEVICE_NAME_LEN).await?.ok_or_else(ended)?;
    let device_name = parse_device_name(&name)?;
    let codec = video.read_exact(CODEC_META_LEN).await?.ok_or_else(ended)?;
    let codec = CodecMeta::parse(&codec)?;

    if codec.codec != params.codec {
        return Err(MirrorError::CaptureServiceUnavailable(format!(
            "service sends {} but {} was requested",
            codec.codec, params.codec
        )));
    }

    Ok(VideoMeta {
        device_name,
        codec: codec.codec,
        width: codec.width,
        height: codec.height,
        framed: params.frame_meta,
    })
}
