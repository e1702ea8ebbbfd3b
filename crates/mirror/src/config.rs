//! Mirroring configuration
//!
//! Loaded from TOML. Every section and field is optional; missing values
//! fall back to the defaults below.

use crate::bridge::BridgeOptions;
use crate::capture::params::{DEFAULT_SERVER_PATH, DEFAULT_SERVER_VERSION};
use crate::capture::{CaptureParams, ServiceInstall, TunnelMode};
use crate::session::SessionOptions;
use crate::usb::{DeviceChooser, DeviceSelector};
use crate::video::PipelineConfig;
use anyhow::{Context, Result, anyhow};
use common::usb_types::{DEFAULT_VENDOR_FILTERS, parse_hex_id};
use protocol::{HOST_MAX_PAYLOAD, VideoCodec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub session: SessionSettings,
    pub usb: UsbSettings,
    pub bridge: BridgeSettings,
    pub capture: CaptureSettings,
    pub video: VideoSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub log_level: String,
    /// How long `stop()` waits before forcing the transport closed
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbSettings {
    /// Vendor ids tried first, as "0xVVVV"; all devices are offered when
    /// none of them match
    pub vendor_filters: Vec<String>,
    /// Pick this device without prompting
    pub serial: Option<String>,
    /// Poll interval of the USB I/O thread
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub handshake_timeout_ms: u64,
    /// Time the user has to approve the host key on the device
    pub auth_timeout_ms: u64,
    pub open_timeout_ms: u64,
    pub max_payload: usize,
    /// Host key file; defaults to <config_dir>/usb-mirror/adbkey
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub codec: VideoCodec,
    pub max_size: u32,
    pub bit_rate: u32,
    pub tunnel: TunnelMode,
    pub server_version: String,
    /// Location of the service on the device
    pub server_path: String,
    /// Push the service from this local file before each session
    pub push_from: Option<PathBuf>,
    pub frame_meta: bool,
    pub startup_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub unit_queue_depth: usize,
    pub max_consecutive_decode_errors: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            stop_timeout_ms: 3_000,
        }
    }
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_filters: DEFAULT_VENDOR_FILTERS
                .iter()
                .map(|(id, _)| format!("{:#06x}", id))
                .collect(),
            serial: None,
            read_timeout_ms: 100,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            auth_timeout_ms: 30_000,
            open_timeout_ms: 10_000,
            max_payload: HOST_MAX_PAYLOAD,
            key_path: None,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            max_size: 1080,
            bit_rate: 8_000_000,
            tunnel: TunnelMode::Forward,
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            server_path: DEFAULT_SERVER_PATH.to_string(),
            push_from: None,
            frame_meta: true,
            startup_timeout_ms: 10_000,
        }
    }
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            unit_queue_depth: 8,
            max_consecutive_decode_errors: 3,
        }
    }
}

impl MirrorConfig {
    /// Load configuration from `path`, or from the standard locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
            None => {
                let candidates = vec![
                    Self::default_path(),
                    PathBuf::from("/etc/usb-mirror/config.toml"),
                ];
                candidates
                    .into_iter()
                    .find(|p| p.exists())
                    .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        let config: MirrorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if none is found
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Self> {
        let explicit = path.is_some();
        match Self::load(path) {
            Ok(config) => Ok(config),
            // A file the user named must exist and be valid
            Err(e) if explicit => Err(e),
            Err(e) => {
                // Logging is not set up yet
                eprintln!("Config: {}", e);
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-mirror").join("config.toml")
        } else {
            PathBuf::from(".config/usb-mirror/config.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.session.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.session.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.vendor_filters {
            validate_hex_id(filter)?;
        }
        if self.usb.serial.as_deref() == Some("") {
            return Err(anyhow!("usb.serial must not be empty"));
        }

        if self.bridge.max_payload < 4096 || self.bridge.max_payload > HOST_MAX_PAYLOAD {
            return Err(anyhow!(
                "bridge.max_payload must be between 4096 and {}",
                HOST_MAX_PAYLOAD
            ));
        }

        if self.capture.bit_rate == 0 {
            return Err(anyhow!("capture.bit_rate must be greater than 0"));
        }
        if self.capture.max_size != 0 && self.capture.max_size < 64 {
            return Err(anyhow!(
                "capture.max_size must be 0 (native) or at least 64, got {}",
                self.capture.max_size
            ));
        }
        if self.capture.server_version.trim().is_empty() {
            return Err(anyhow!("capture.server_version must not be empty"));
        }

        if self.video.unit_queue_depth == 0 {
            return Err(anyhow!("video.unit_queue_depth must be at least 1"));
        }
        if self.video.max_consecutive_decode_errors == 0 {
            return Err(anyhow!(
                "video.max_consecutive_decode_errors must be at least 1"
            ));
        }
        Ok(())
    }

    /// Parsed vendor filter list
    pub fn vendor_ids(&self) -> Vec<u16> {
        self.usb
            .vendor_filters
            .iter()
            .filter_map(|f| parse_hex_id(f))
            .collect()
    }

    pub fn device_selector(&self, chooser: Arc<dyn DeviceChooser>) -> DeviceSelector {
        let selector = DeviceSelector::new(chooser).with_vendor_filters(self.vendor_ids());
        match &self.usb.serial {
            Some(serial) => selector.with_serial(serial.clone()),
            None => selector,
        }
    }

    pub fn usb_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.usb.read_timeout_ms)
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            handshake_timeout: Duration::from_millis(self.bridge.handshake_timeout_ms),
            auth_timeout: Duration::from_millis(self.bridge.auth_timeout_ms),
            open_timeout: Duration::from_millis(self.bridge.open_timeout_ms),
            max_payload: self.bridge.max_payload,
        }
    }

    pub fn capture_params(&self) -> CaptureParams {
        let remote_path = self.capture.server_path.clone();
        let install = match &self.capture.push_from {
            Some(local) => ServiceInstall::Push {
                local: PathBuf::from(shellexpand::tilde(&local.to_string_lossy()).as_ref()),
                remote_path,
            },
            None => ServiceInstall::Resident { remote_path },
        };
        CaptureParams {
            codec: self.capture.codec,
            max_size: self.capture.max_size,
            bit_rate: self.capture.bit_rate,
            tunnel: self.capture.tunnel,
            server_version: self.capture.server_version.clone(),
            install,
            frame_meta: self.capture.frame_meta,
            startup_timeout: Duration::from_millis(self.capture.startup_timeout_ms),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            bridge: self.bridge_options(),
            pipeline: PipelineConfig {
                unit_queue_depth: self.video.unit_queue_depth,
                max_consecutive_decode_errors: self.video.max_consecutive_decode_errors,
            },
            stop_timeout: Duration::from_millis(self.session.stop_timeout_ms),
        }
    }

    /// Host key path with `~` expanded
    pub fn key_path(&self) -> Option<PathBuf> {
        self.bridge
            .key_path
            .as_ref()
            .map(|p| PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()))
    }
}

/// Check a "0xVVVV" vendor id
pub fn validate_hex_id(value: &str) -> Result<u16> {
    parse_hex_id(value).ok_or_else(|| {
        anyhow!(
            "Invalid vendor filter '{}', expected a hex id like 0x18d1",
            value
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = MirrorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.vendor_ids().len(), DEFAULT_VENDOR_FILTERS.len());
        assert_eq!(config.vendor_ids()[0], 0x18d1);
        assert_eq!(config.capture_params(), CaptureParams::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: MirrorConfig = toml::from_str(
            r#"
            [capture]
            max_size = 720
            tunnel = "reverse"

            [usb]
            serial = "R58M123"
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.max_size, 720);
        assert_eq!(config.capture.tunnel, TunnelMode::Reverse);
        assert_eq!(config.capture.bit_rate, 8_000_000);
        assert_eq!(config.usb.serial.as_deref(), Some("R58M123"));
        assert_eq!(config.session.log_level, "info");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MirrorConfig::default();
        config.session.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::default();
        config.usb.vendor_filters.push("google".to_string());
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::default();
        config.capture.bit_rate = 0;
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::default();
        config.capture.max_size = 10;
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::default();
        config.video.unit_queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::default();
        config.video.max_consecutive_decode_errors = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = MirrorConfig::default();
        config.capture.push_from = Some(PathBuf::from("/opt/scrcpy-server.jar"));
        config.bridge.auth_timeout_ms = 60_000;
        config.save(&path).unwrap();

        let loaded = MirrorConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
        assert!(matches!(
            loaded.capture_params().install,
            ServiceInstall::Push { .. }
        ));
        assert_eq!(
            loaded.bridge_options().auth_timeout,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(MirrorConfig::load_or_default(Some(missing)).is_err());
    }

    #[test]
    fn test_validate_hex_id() {
        assert_eq!(validate_hex_id("0x04e8").unwrap(), 0x04e8);
        assert!(validate_hex_id("04e8x").is_err());
    }
}
