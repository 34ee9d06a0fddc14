use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use droidlink_core::BridgeError;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::{parse_devices, BridgeRunner, ExitInfo, ProcessPipe, RemoteProcess};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

// MARK: - AdbBridge

/// [`BridgeRunner`] backed by the `adb` executable.
#[derive(Debug, Clone)]
pub struct AdbBridge {
    program: PathBuf,
    timeout: Duration,
}

impl AdbBridge {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), timeout: DEFAULT_COMMAND_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.program.display(), args.join(" "))
    }

    /// Run one adb command to completion and return its stdout.
    ///
    /// `output()` drains stdout and stderr concurrently, so a chatty command
    /// cannot block on a full pipe and trip the timeout.
    async fn run(&self, args: Vec<String>) -> Result<String, BridgeError> {
        let command = self.describe(&args);
        debug!("adb: {}", command);

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(BridgeError::Spawn { command, source }),
            Err(_) => {
                return Err(BridgeError::Timeout { command, ms: self.timeout.as_millis() as u64 })
            }
        };

        if !output.status.success() {
            return Err(BridgeError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn serial_args(serial: &str, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["-s".to_string(), serial.to_string()];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }
}

#[async_trait]
impl BridgeRunner for AdbBridge {
    async fn list_devices(&self) -> Result<Vec<String>, BridgeError> {
        let output = self.run(vec!["devices".to_string()]).await?;
        Ok(parse_devices(&output))
    }

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<(), BridgeError> {
        let local = local.to_string_lossy();
        self.run(Self::serial_args(serial, &["push", local.as_ref(), remote])).await?;
        Ok(())
    }

    async fn forward(&self, serial: &str, local_port: u16, socket_name: &str) -> Result<(), BridgeError> {
        let local = format!("tcp:{local_port}");
        let remote = format!("localabstract:{socket_name}");
        self.run(Self::serial_args(serial, &["forward", local.as_str(), remote.as_str()])).await?;
        Ok(())
    }

    async fn remove_forward(&self, serial: &str, local_port: u16) -> Result<(), BridgeError> {
        let local = format!("tcp:{local_port}");
        self.run(Self::serial_args(serial, &["forward", "--remove", local.as_str()])).await?;
        Ok(())
    }

    async fn shell(&self, serial: &str, command: &str) -> Result<String, BridgeError> {
        self.run(Self::serial_args(serial, &["shell", command])).await
    }

    async fn start_process(&self, serial: &str, args: &[String]) -> Result<Box<dyn RemoteProcess>, BridgeError> {
        let mut full = Self::serial_args(serial, &["shell"]);
        full.extend(args.iter().cloned());
        let command = self.describe(&full);
        debug!("adb (long-lived): {}", command);

        let child = Command::new(&self.program)
            .args(&full)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn { command, source })?;
        debug!("adb shell child started (pid {:?})", child.id());

        Ok(Box::new(AdbProcess { child }))
    }
}

// MARK: - AdbProcess

/// A running `adb shell` child.
#[derive(Debug)]
pub struct AdbProcess {
    child: Child,
}

impl RemoteProcess for AdbProcess {
    fn take_stdout(&mut self) -> Option<ProcessPipe> {
        self.child.stdout.take().map(|pipe| Box::new(pipe) as ProcessPipe)
    }

    fn take_stderr(&mut self) -> Option<ProcessPipe> {
        self.child.stderr.take().map(|pipe| Box::new(pipe) as ProcessPipe)
    }

    fn try_exit(&mut self) -> Option<ExitInfo> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(ExitInfo { code: status.code() }),
            Ok(None) => None,
            // The handle is unusable; treat the process as gone.
            Err(_) => Some(ExitInfo { code: None }),
        }
    }

    fn kill(&mut self) -> std::io::Result<()> {
        if self.try_exit().is_some() {
            return Ok(());
        }
        self.child.start_kill()
    }
}
