use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DroidLinkError;

/// Session parameters supplied by the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(alias = "adbPath")]
    pub adb_path: String,
    /// Local copy of the device server payload.
    #[serde(alias = "serverPath")]
    pub server_path: PathBuf,
    /// Preferred device serial. The first attached device is used when unset
    /// or not present.
    pub serial: Option<String>,
    /// Resolution cap on the longest side. 0 leaves the size unconstrained.
    #[serde(alias = "maxSize")]
    pub max_size: u32,
    /// Bits per second.
    pub bitrate: u32,
    #[serde(alias = "maxFps")]
    pub max_fps: u32,
    #[serde(alias = "videoEncoder")]
    pub video_encoder: Option<String>,
    /// Open the control socket alongside the video socket.
    pub control: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".into(),
            server_path: PathBuf::from("scrcpy-server.jar"),
            serial: None,
            max_size: 0,
            bitrate: 8_000_000,
            max_fps: 60,
            video_encoder: None,
            control: true,
        }
    }
}

impl SessionConfig {
    /// Read a JSON config file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DroidLinkError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| DroidLinkError::ConfigurationInvalid {
            reason: format!("{}: {e}", path.display()),
        })
    }

    /// Launch parameters for a normal (non-compat) session.
    pub fn server_params(&self) -> ServerParams {
        ServerParams {
            max_size: self.max_size,
            bitrate: self.bitrate,
            max_fps: self.max_fps,
            video_encoder: self
                .video_encoder
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned),
            control: self.control,
        }
    }
}

// MARK: - ServerParams

/// Values handed verbatim to the device server launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerParams {
    pub max_size: u32,
    pub bitrate: u32,
    pub max_fps: u32,
    pub video_encoder: Option<String>,
    pub control: bool,
}

impl ServerParams {
    pub const COMPAT_MAX_SIZE: u32 = 800;
    pub const COMPAT_BITRATE: u32 = 2_000_000;
    pub const COMPAT_MAX_FPS: u32 = 30;
    pub const COMPAT_ENCODER: &'static str = "OMX.google.h264.encoder";

    /// Reduced profile used after the device's preferred encoder failed.
    pub fn compat(control: bool) -> Self {
        Self {
            max_size: Self::COMPAT_MAX_SIZE,
            bitrate: Self::COMPAT_BITRATE,
            max_fps: Self::COMPAT_MAX_FPS,
            video_encoder: Some(Self::COMPAT_ENCODER.to_owned()),
            control,
        }
    }
}

impl std::fmt::Display for ServerParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "maxSize={}, bitrate={:.1}Mbps, fps={}, encoder={}",
            self.max_size,
            self.bitrate as f64 / 1_000_000.0,
            self.max_fps,
            self.video_encoder.as_deref().unwrap_or("(default)")
        )
    }
}

// MARK: - RetryPolicy

/// Timings and retry bounds of the connection state machine.
///
/// The defaults are the observable behaviour of the engine; tests shrink
/// them to keep scenarios fast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait after port forwarding before the first video connect.
    pub settle_delay: Duration,
    pub video_connect_attempts: u32,
    pub video_retry_interval: Duration,
    /// Bound on the server's dummy byte (and the device-name read).
    pub handshake_timeout: Duration,
    /// Pause between video connect, control connect and device-name read.
    pub handshake_step_delay: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Time given to the device encoder to release before the compat retry.
    pub compat_release_delay: Duration,
    /// Pause after the orphan-server kill.
    pub orphan_kill_settle: Duration,
    /// Upper bound for a single bridge command.
    pub command_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            video_connect_attempts: 10,
            video_retry_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            handshake_step_delay: Duration::from_millis(500),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(5),
            compat_release_delay: Duration::from_secs(2),
            orphan_kill_settle: Duration::from_secs(1),
            command_timeout: Duration::from_secs(10),
        }
    }
}
