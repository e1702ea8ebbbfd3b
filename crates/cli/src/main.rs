//! usb-mirror
//!
//! Mirrors the screen of a USB-attached phone: selects the device, runs the
//! bridge handshake, launches the capture service and decodes its video
//! until Ctrl+C or a session error.

mod prompt;

use anyhow::{Context, Result, bail};
use clap::Parser;
use common::{HostKey, setup_logging};
use mirror::{
    DecodedFrame, DrawCallback, EventSink, MirrorConfig, SessionController, SessionEvent,
    SessionHandle, SessionState, TunnelMode, UsbDeviceProvider,
};
use prompt::TerminalChooser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "usb-mirror")]
#[command(author, version, about = "Mirror the screen of a USB-attached phone")]
#[command(long_about = "
Mirrors the screen of a phone attached over USB. The host authenticates with
its RSA key, launches the capture service on the device and decodes the
video stream it sends back.

EXAMPLES:
    # Mirror the only attached phone (prompts when several are attached)
    usb-mirror

    # Pick a device by serial number
    usb-mirror --serial 29041FDH2000AB

    # Lower resolution and bit rate
    usb-mirror --max-size 720 --bit-rate 4000000

    # Print session events as JSON lines
    usb-mirror --json

CONFIGURATION:
    The configuration file is searched in the following order:
    1. Path specified with --config
    2. ~/.config/usb-mirror/config.toml
    3. /etc/usb-mirror/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Serial number of the device to mirror
    #[arg(short, long, value_name = "SERIAL")]
    serial: Option<String>,

    /// Cap the longer video dimension, in pixels (0 keeps the native size)
    #[arg(long, value_name = "PIXELS")]
    max_size: Option<u32>,

    /// Video bit rate in bits per second
    #[arg(long, value_name = "BPS")]
    bit_rate: Option<u32>,

    /// How video reaches the host (forward, reverse, inline)
    #[arg(long, value_name = "MODE", value_parser = parse_tunnel)]
    tunnel: Option<TunnelMode>,

    /// Print session events as JSON lines
    #[arg(long)]
    json: bool,
}

fn parse_tunnel(value: &str) -> Result<TunnelMode, String> {
    match value.to_ascii_lowercase().as_str() {
        "forward" => Ok(TunnelMode::Forward),
        "reverse" => Ok(TunnelMode::Reverse),
        "inline" => Ok(TunnelMode::Inline),
        other => Err(format!(
            "unknown tunnel mode '{}' (expected forward, reverse or inline)",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = MirrorConfig::default();
        let path = MirrorConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config =
        MirrorConfig::load_or_default(args.config.clone()).context("Failed to load configuration")?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    let log_level = config.session.log_level.clone();
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("usb-mirror v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let key_path = config.key_path();
    let key = tokio::task::spawn_blocking(move || HostKey::load_or_generate(key_path.as_deref()))
        .await
        .context("Host key task failed")?
        .context("Failed to load host key")?;

    let provider = Arc::new(UsbDeviceProvider::new(config.usb_poll_timeout()));
    let controller = SessionController::new(provider, Arc::new(key), config.session_options());

    let frames = Arc::new(FrameCounter::default());
    let handle = controller
        .start(
            config.device_selector(Arc::new(TerminalChooser)),
            config.capture_params(),
            event_printer(args.json),
            frames.draw_callback(),
        )
        .await
        .context("Failed to start session")?;

    let outcome = run_until_done(handle, &frames).await;

    controller.stop().await.context("Failed to stop session")?;
    info!("Shutting down after {} frames", frames.count());

    if outcome == SessionState::Error {
        bail!("Session ended with an error");
    }
    Ok(())
}

fn apply_overrides(config: &mut MirrorConfig, args: &Args) {
    if let Some(level) = &args.log_level {
        config.session.log_level = level.clone();
    }
    if let Some(serial) = &args.serial {
        config.usb.serial = Some(serial.clone());
    }
    if let Some(max_size) = args.max_size {
        config.capture.max_size = max_size;
    }
    if let Some(bit_rate) = args.bit_rate {
        config.capture.bit_rate = bit_rate;
    }
    if let Some(tunnel) = args.tunnel {
        config.capture.tunnel = tunnel;
    }
}

/// Wait for Ctrl+C or a terminal session state, logging stats meanwhile
async fn run_until_done(mut handle: SessionHandle, frames: &FrameCounter) -> SessionState {
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to wait for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C");
                return handle.state();
            }
            state = handle.wait_for(|s| s.is_terminal()) => {
                return state;
            }
            _ = ticker.tick() => {
                if let Some(stats) = handle.stats() {
                    info!(
                        "{} units, {} decoded, {} presented, {} dropped, {} decode errors",
                        stats.units_demuxed,
                        stats.frames_decoded,
                        stats.frames_presented,
                        stats.frames_dropped,
                        stats.decode_errors
                    );
                } else {
                    debug!("{} frames drawn", frames.count());
                }
            }
        }
    }
}

fn event_printer(json: bool) -> EventSink {
    Arc::new(move |event: SessionEvent| {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode event: {}", e),
            }
        } else {
            println!("{}", event);
        }
        if let Some(hint) = error_hint(&event) {
            eprintln!("{}", hint);
        }
    })
}

/// Advice printed after an error event the user can act on
fn error_hint(event: &SessionEvent) -> Option<&'static str> {
    match event.error {
        Some("unsupported_codec") if !cfg!(feature = "h264") => {
            Some("This build has no video decoder; rebuild with `--features h264`.")
        }
        Some("unsupported_codec") => Some("Request an H.264 stream from the device."),
        _ => None,
    }
}

/// Draw target for a terminal session: counts frames, logs size changes
#[derive(Debug, Default)]
struct FrameCounter {
    drawn: AtomicU64,
    /// Last seen `width << 16 | height`
    size: AtomicU32,
}

impl FrameCounter {
    fn count(&self) -> u64 {
        self.drawn.load(Ordering::Relaxed)
    }

    fn draw_callback(self: &Arc<Self>) -> DrawCallback {
        let counter = Arc::clone(self);
        Arc::new(move |frame: &DecodedFrame| counter.draw(frame))
    }

    fn draw(&self, frame: &DecodedFrame) {
        self.drawn.fetch_add(1, Ordering::Relaxed);
        let size = (frame.width.min(0xffff) << 16) | frame.height.min(0xffff);
        if self.size.swap(size, Ordering::Relaxed) != size {
            info!("Video size {}x{}", frame.width, frame.height);
        }
    }
}
