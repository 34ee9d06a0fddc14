//! droidlink-transport — the two sockets of a mirroring session
//!
//! Both channels connect to the same forwarded loopback port: the device
//! server accepts the video socket first and the control socket second.
//!
//! # Video socket
//! ```text
//! [1]          dummy byte (liveness)
//! [64]         device name, UTF-8, NUL padded
//! [4][4][4]    codec id, initial width, initial height (BE)
//! repeated:
//!   [8]        pts (BE, bits 63/62 = config/key-frame flags)
//!   [4]        payload size (BE, signed)
//!   [size]     H.264 access unit
//! ```
//!
//! # Control socket
//! Fire-and-forget binary messages, see [`ControlMessage`].

pub mod control;
pub mod video;

pub use control::{ControlChannel, ControlMessage, KeyAction, TouchAction};
pub use video::{CodecMeta, PacketRead, PacketReader, VideoChannel};

/// Length of the device-name field that follows the dummy byte.
pub const DEVICE_NAME_LEN: usize = 64;

/// Size of both the codec-metadata header and each packet header.
pub const HEADER_LEN: usize = 12;

/// Payload sizes above this are treated as corrupt framing.
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

pub(crate) fn loopback(port: u16) -> std::net::SocketAddr {
    std::net::SocketAddr::from(([127, 0, 0, 1], port))
}
