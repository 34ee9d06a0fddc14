use thiserror::Error;

#[derive(Error, Debug)]
pub enum DroidLinkError {
    #[error("No device attached")]
    NoDevice,

    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Bridge command failed: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Server crashed (exit: {exit_code:?})\nLog:\n{log}")]
    ServerCrashed { exit_code: Option<i32>, log: String },

    #[error("Failed after {attempts} retries.\nServer alive: {server_alive}\nLog:\n{log}")]
    HandshakeFailed { attempts: u32, server_alive: bool, log: String },

    #[error("Device encoder failed, switching to compatibility mode")]
    EncoderFailure,

    #[error("Connection superseded by a newer request")]
    Superseded,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decoder error: {0}")]
    Decoder(#[from] DecoderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DroidLinkError {
    /// Pre-flight failures are reported once and never retried.
    pub fn is_preflight(&self) -> bool {
        matches!(self, Self::NoDevice | Self::Bridge(_) | Self::ConfigurationInvalid { .. })
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("`{command}` exited with {code:?}: {stderr}")]
    CommandFailed { command: String, code: Option<i32>, stderr: String },

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {ms}ms")]
    Timeout { command: String, ms: u64 },

    #[error("Failed to capture {stream} of `{command}`")]
    MissingPipe { command: String, stream: &'static str },
}

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("No H.264 decoder available")]
    Unavailable,

    #[error("GStreamer pipeline error: {0}")]
    Pipeline(String),

    #[error("Failed to decode frame: {reason}")]
    DecodeFailed { reason: String },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Server did not send dummy byte within {ms}ms - server may have crashed")]
    NoDummyByte { ms: u64 },

    #[error("Stream ended after {got} bytes (expected {expected})")]
    ShortRead { got: usize, expected: usize },

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
