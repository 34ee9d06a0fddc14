//! droidlink-bridge — debug-bridge plumbing
//!
//! The session engine never shells out directly; it talks to a
//! [`BridgeRunner`]. [`AdbBridge`] is the production implementation that
//! drives the `adb` executable, tests plug in scripted runners.

mod adb;
mod parse;

use std::path::Path;

use async_trait::async_trait;
use droidlink_core::BridgeError;
use tokio::io::AsyncRead;

pub use adb::{AdbBridge, AdbProcess};
pub use parse::parse_devices;

/// Boxed pipe of a remote process (stdout or stderr).
pub type ProcessPipe = Box<dyn AsyncRead + Send + Unpin>;

// MARK: - BridgeRunner

/// Commands the session engine needs from the debug bridge.
///
/// Every call fails with [`BridgeError`] when the underlying command exits
/// non-zero.
#[async_trait]
pub trait BridgeRunner: Send + Sync {
    /// Serials of devices in the `device` state.
    async fn list_devices(&self) -> Result<Vec<String>, BridgeError>;

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<(), BridgeError>;

    /// Tunnel `127.0.0.1:local_port` to the device's abstract socket.
    async fn forward(&self, serial: &str, local_port: u16, socket_name: &str) -> Result<(), BridgeError>;

    async fn remove_forward(&self, serial: &str, local_port: u16) -> Result<(), BridgeError>;

    /// Run a shell command on the device and return its trimmed stdout.
    async fn shell(&self, serial: &str, command: &str) -> Result<String, BridgeError>;

    /// Start a long-lived shell process on the device.
    ///
    /// The caller must keep draining both pipes, otherwise the remote side
    /// stalls once the pipe buffer fills.
    async fn start_process(&self, serial: &str, args: &[String]) -> Result<Box<dyn RemoteProcess>, BridgeError>;
}

// MARK: - RemoteProcess

/// Handle to a child process started through the bridge.
pub trait RemoteProcess: Send {
    fn take_stdout(&mut self) -> Option<ProcessPipe>;

    fn take_stderr(&mut self) -> Option<ProcessPipe>;

    /// `None` while the process is still running.
    fn try_exit(&mut self) -> Option<ExitInfo>;

    /// Request termination. Safe to call on an exited process.
    fn kill(&mut self) -> std::io::Result<()>;
}

/// How a remote process ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}
