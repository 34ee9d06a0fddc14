//! Device server deployment: push, orphan cleanup, launch.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use droidlink_bridge::{BridgeRunner, RemoteProcess};
use droidlink_core::{BridgeError, ServerParams};
use tracing::debug;

/// Where the server payload lives on the device.
pub const REMOTE_SERVER_PATH: &str = "/data/local/tmp/scrcpy-server.jar";
pub const SERVER_CLASS: &str = "com.genymobile.scrcpy.Server";
pub const SERVER_VERSION: &str = "2.4";

/// Exclusive upper bound of a session id.
pub const SCID_LIMIT: u32 = 0xFF_FFFF;

const ORPHAN_KILL: &str = "kill -9 $(ps | grep app_process | grep -v grep | awk '{print $2}')";

/// Random session id in `[1, SCID_LIMIT)`.
pub fn generate_scid() -> u32 {
    let b = uuid::Uuid::new_v4().into_bytes();
    let raw = u32::from_be_bytes([0, b[0], b[1], b[2]]);
    1 + raw % (SCID_LIMIT - 1)
}

/// Abstract socket the server listens on for a given session id.
///
/// The server reads `scid=` as hexadecimal and formats the socket name
/// with `%08x`; passing the same digits on both sides keeps them equal.
pub fn socket_name(scid: u32) -> String {
    format!("scrcpy_{scid:08}")
}

/// Arguments for `adb shell` that start the server.
pub fn build_server_args(scid: u32, params: &ServerParams) -> Vec<String> {
    let mut args = vec![
        format!("CLASSPATH={REMOTE_SERVER_PATH}"),
        "app_process".to_string(),
        "/".to_string(),
        SERVER_CLASS.to_string(),
        SERVER_VERSION.to_string(),
        format!("scid={scid}"),
        "tunnel_forward=true".to_string(),
        "video=true".to_string(),
        "audio=false".to_string(),
        format!("control={}", params.control),
        "cleanup=false".to_string(),
        format!("max_size={}", params.max_size),
        format!("video_bit_rate={}", params.bitrate),
        format!("max_fps={}", params.max_fps),
        "send_dummy_byte=true".to_string(),
        "send_codec_meta=true".to_string(),
        "send_device_meta=true".to_string(),
    ];
    if let Some(encoder) = params.video_encoder.as_deref().filter(|e| !e.is_empty()) {
        args.push(format!("video_encoder={encoder}"));
    }
    args
}

// MARK: - ServerLauncher

/// A started server and the names needed to reach it.
pub struct LaunchedServer {
    pub process: Box<dyn RemoteProcess>,
    pub scid: u32,
    pub socket_name: String,
}

pub struct ServerLauncher {
    bridge: Arc<dyn BridgeRunner>,
    orphan_settle: Duration,
}

impl ServerLauncher {
    pub fn new(bridge: Arc<dyn BridgeRunner>, orphan_settle: Duration) -> Self {
        Self { bridge, orphan_settle }
    }

    pub async fn push(&self, serial: &str, local: &Path) -> Result<(), BridgeError> {
        self.bridge.push(serial, local, REMOTE_SERVER_PATH).await
    }

    /// Kill leftover servers from earlier runs. Failure is harmless since
    /// every session uses a fresh socket name.
    pub async fn kill_orphans(&self, serial: &str) {
        if let Err(e) = self.bridge.shell(serial, ORPHAN_KILL).await {
            debug!("Orphan server cleanup on {} failed (ignored): {}", serial, e);
        }
        tokio::time::sleep(self.orphan_settle).await;
    }

    pub async fn start(&self, serial: &str, params: &ServerParams) -> Result<LaunchedServer, BridgeError> {
        self.kill_orphans(serial).await;

        let scid = generate_scid();
        let args = build_server_args(scid, params);
        debug!("Starting server on {}: {}", serial, args.join(" "));
        let process = self.bridge.start_process(serial, &args).await?;

        Ok(LaunchedServer { process, scid, socket_name: socket_name(scid) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scid_stays_in_range() {
        for _ in 0..10_000 {
            let scid = generate_scid();
            assert!((1..SCID_LIMIT).contains(&scid), "scid {scid} out of range");
        }
    }

    #[test]
    fn socket_name_is_zero_padded() {
        assert_eq!(socket_name(1), "scrcpy_00000001");
        assert_eq!(socket_name(12_345_678), "scrcpy_12345678");
    }

    #[test]
    fn default_launch_arguments() {
        let params = ServerParams {
            max_size: 0,
            bitrate: 8_000_000,
            max_fps: 60,
            video_encoder: None,
            control: true,
        };
        let args = build_server_args(42, &params);
        assert_eq!(
            args,
            vec![
                "CLASSPATH=/data/local/tmp/scrcpy-server.jar",
                "app_process",
                "/",
                "com.genymobile.scrcpy.Server",
                "2.4",
                "scid=42",
                "tunnel_forward=true",
                "video=true",
                "audio=false",
                "control=true",
                "cleanup=false",
                "max_size=0",
                "video_bit_rate=8000000",
                "max_fps=60",
                "send_dummy_byte=true",
                "send_codec_meta=true",
                "send_device_meta=true",
            ]
        );
    }

    #[test]
    fn compat_arguments_name_the_software_encoder() {
        let args = build_server_args(7, &ServerParams::compat(false));
        assert!(args.contains(&"control=false".to_string()));
        assert!(args.contains(&"max_size=800".to_string()));
        assert!(args.contains(&"video_bit_rate=2000000".to_string()));
        assert!(args.contains(&"max_fps=30".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("video_encoder=OMX.google.h264.encoder"));
    }

    #[test]
    fn empty_encoder_is_omitted() {
        let params = ServerParams {
            max_size: 1024,
            bitrate: 4_000_000,
            max_fps: 30,
            video_encoder: Some(String::new()),
            control: true,
        };
        assert!(!build_server_args(9, &params).iter().any(|a| a.starts_with("video_encoder")));
    }
}
