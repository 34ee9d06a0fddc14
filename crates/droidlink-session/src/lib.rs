//! droidlink-session — device server launch and the session state machine
//!
//! [`SessionEngine`] owns one mirroring session at a time: it deploys the
//! device server through a [`BridgeRunner`](droidlink_bridge::BridgeRunner),
//! opens the video and control sockets, runs the decode thread and recovers
//! from crashes, dropped connections and encoder failures.

mod engine;
pub mod launcher;
pub mod server_log;

#[cfg(test)]
mod tests;

pub use engine::SessionEngine;
pub use launcher::{build_server_args, generate_scid, socket_name, LaunchedServer, ServerLauncher};
pub use server_log::{is_encoder_failure, ServerLog};
