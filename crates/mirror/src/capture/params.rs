//! Capture session parameters and the service command line

use protocol::VideoCodec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where the capture service binary lives on the device
pub const DEFAULT_SERVER_PATH: &str = "/data/local/tmp/scrcpy-server.jar";

/// Service protocol version the host speaks
pub const DEFAULT_SERVER_VERSION: &str = "2.1";

const SERVER_CLASS: &str = "com.genymobile.scrcpy.Server";

/// How the control and video channels reach the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// The host opens two `localabstract:` streams to the service
    #[default]
    Forward,
    /// The service opens two streams back to the host
    Reverse,
    /// Both channels are multiplexed inside the service stream's stdout
    Inline,
}

impl TunnelMode {
    pub fn name(self) -> &'static str {
        match self {
            TunnelMode::Forward => "forward",
            TunnelMode::Reverse => "reverse",
            TunnelMode::Inline => "inline",
        }
    }
}

/// How the service binary gets onto the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceInstall {
    /// Already present at `remote_path`
    Resident { remote_path: String },
    /// Pushed from a local file before launch
    Push { local: PathBuf, remote_path: String },
}

impl ServiceInstall {
    pub fn remote_path(&self) -> &str {
        match self {
            ServiceInstall::Resident { remote_path } | ServiceInstall::Push { remote_path, .. } => {
                remote_path
            }
        }
    }
}

impl Default for ServiceInstall {
    fn default() -> Self {
        ServiceInstall::Resident {
            remote_path: DEFAULT_SERVER_PATH.to_string(),
        }
    }
}

/// Parameters for one capture session
///
/// Audio is never requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureParams {
    pub codec: VideoCodec,
    /// Longest side of the captured frames, 0 for native resolution
    pub max_size: u32,
    /// Encoder bit rate in bits per second
    pub bit_rate: u32,
    pub tunnel: TunnelMode,
    pub server_version: String,
    pub install: ServiceInstall,
    /// Ask for a 12-byte header before each video packet; without it the
    /// video stream is raw Annex B
    pub frame_meta: bool,
    /// Time allowed from launch until the video preamble has arrived
    pub startup_timeout: Duration,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            max_size: 1080,
            bit_rate: 8_000_000,
            tunnel: TunnelMode::Forward,
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            install: ServiceInstall::default(),
            frame_meta: true,
            startup_timeout: Duration::from_secs(10),
        }
    }
}

impl CaptureParams {
    /// Shell command that launches the service for session `scid`
    pub fn service_command(&self, scid: &str) -> String {
        let forward = self.tunnel == TunnelMode::Forward;
        format!(
            "CLASSPATH={} app_process / {} {} scid={} log_level=info video_codec={} \
             max_size={} video_bit_rate={} audio=false control=true tunnel_forward={} \
             send_device_meta=true send_frame_meta={} send_dummy_byte={}",
            self.install.remote_path(),
            SERVER_CLASS,
            self.server_version,
            scid,
            self.codec,
            self.max_size,
            self.bit_rate,
            forward,
            self.frame_meta,
            forward,
        )
    }
}

/// Abstract socket name the service listens on (or connects to)
pub fn socket_name(scid: &str) -> String {
    format!("scrcpy_{}", scid)
}

/// Random 31-bit session id as 8 hex digits
pub fn new_scid() -> String {
    format!("{:08x}", rand::random::<u32>() & 0x7fff_ffff)
}
