//! Control socket: desktop input encoded as device-server control messages.
//!
//! # Message layouts (all multi-byte fields big-endian)
//! ```text
//! key       (14 B)  [type=0][action][keycode i32][repeat i32 = 0][meta i32]
//! touch     (32 B)  [type=2][action][pointer i64][x i32][y i32][w u16][h u16]
//!                   [pressure u16][action button i32][buttons i32]
//! clipboard (14+N)  [type=9][sequence i64 = 0][paste u8][len i32][utf-8 × N]
//! rotate    (1 B)   [type=11]
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use droidlink_core::TransportError;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::loopback;

// MARK: - Actions

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down = 0,
    Up = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Down = 0,
    Up = 1,
    Move = 2,
}

impl KeyAction {
    fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Down),
            1 => Some(Self::Up),
            _ => None,
        }
    }
}

impl TouchAction {
    fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Down),
            1 => Some(Self::Up),
            2 => Some(Self::Move),
            _ => None,
        }
    }
}

// MARK: - ControlMessage

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    InjectKeycode {
        action: KeyAction,
        keycode: i32,
        meta_state: i32,
    },
    InjectTouch {
        action: TouchAction,
        pointer_id: i64,
        x: i32,
        y: i32,
        screen_width: u16,
        screen_height: u16,
        /// `[0.0, 1.0]`, quantised to 16 bits on the wire.
        pressure: f32,
        /// Button whose state changed with this event.
        action_button: i32,
        /// Bitmask of buttons currently held.
        buttons: i32,
    },
    /// Push text to the device clipboard; with `paste` the device types it
    /// out immediately.
    SetClipboard { text: String, paste: bool },
    RotateDevice,
}

impl ControlMessage {
    pub const TYPE_INJECT_KEYCODE: u8 = 0;
    pub const TYPE_INJECT_TOUCH_EVENT: u8 = 2;
    pub const TYPE_SET_CLIPBOARD: u8 = 9;
    pub const TYPE_ROTATE_DEVICE: u8 = 11;

    pub const KEY_LEN: usize = 14;
    pub const TOUCH_LEN: usize = 32;
    pub const CLIPBOARD_HEADER_LEN: usize = 14;

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::InjectKeycode { .. } => Self::KEY_LEN,
            Self::InjectTouch { .. } => Self::TOUCH_LEN,
            Self::SetClipboard { text, .. } => Self::CLIPBOARD_HEADER_LEN + text.len(),
            Self::RotateDevice => 1,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            Self::InjectKeycode { action, keycode, meta_state } => {
                buf.put_u8(Self::TYPE_INJECT_KEYCODE);
                buf.put_u8(*action as u8);
                buf.put_i32(*keycode);
                buf.put_i32(0); // repeat
                buf.put_i32(*meta_state);
            }
            Self::InjectTouch {
                action,
                pointer_id,
                x,
                y,
                screen_width,
                screen_height,
                pressure,
                action_button,
                buttons,
            } => {
                buf.put_u8(Self::TYPE_INJECT_TOUCH_EVENT);
                buf.put_u8(*action as u8);
                buf.put_i64(*pointer_id);
                buf.put_i32(*x);
                buf.put_i32(*y);
                buf.put_u16(*screen_width);
                buf.put_u16(*screen_height);
                buf.put_u16(quantize_pressure(*pressure));
                buf.put_i32(*action_button);
                buf.put_i32(*buttons);
            }
            Self::SetClipboard { text, paste } => {
                buf.put_u8(Self::TYPE_SET_CLIPBOARD);
                buf.put_i64(0); // sequence, acks are not tracked
                buf.put_u8(u8::from(*paste));
                buf.put_i32(text.len() as i32);
                buf.put_slice(text.as_bytes());
            }
            Self::RotateDevice => buf.put_u8(Self::TYPE_ROTATE_DEVICE),
        }
        buf.freeze()
    }

    /// Parse one message from the front of `buf`, returning it with the
    /// number of bytes consumed. `None` when the buffer is incomplete or the
    /// type is unknown.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        let (&kind, mut rest) = buf.split_first()?;
        match kind {
            Self::TYPE_INJECT_KEYCODE if buf.len() >= Self::KEY_LEN => {
                let action = KeyAction::from_wire(rest.get_u8())?;
                let keycode = rest.get_i32();
                let _repeat = rest.get_i32();
                let meta_state = rest.get_i32();
                Some((Self::InjectKeycode { action, keycode, meta_state }, Self::KEY_LEN))
            }
            Self::TYPE_INJECT_TOUCH_EVENT if buf.len() >= Self::TOUCH_LEN => {
                let action = TouchAction::from_wire(rest.get_u8())?;
                let msg = Self::InjectTouch {
                    action,
                    pointer_id: rest.get_i64(),
                    x: rest.get_i32(),
                    y: rest.get_i32(),
                    screen_width: rest.get_u16(),
                    screen_height: rest.get_u16(),
                    pressure: rest.get_u16() as f32 / u16::MAX as f32,
                    action_button: rest.get_i32(),
                    buttons: rest.get_i32(),
                };
                Some((msg, Self::TOUCH_LEN))
            }
            Self::TYPE_SET_CLIPBOARD if buf.len() >= Self::CLIPBOARD_HEADER_LEN => {
                let _sequence = rest.get_i64();
                let paste = rest.get_u8() != 0;
                let len = usize::try_from(rest.get_i32()).ok()?;
                if rest.len() < len {
                    return None;
                }
                let text = String::from_utf8(rest[..len].to_vec()).ok()?;
                Some((Self::SetClipboard { text, paste }, Self::CLIPBOARD_HEADER_LEN + len))
            }
            Self::TYPE_ROTATE_DEVICE => Some((Self::RotateDevice, 1)),
            _ => None,
        }
    }
}

fn quantize_pressure(pressure: f32) -> u16 {
    (pressure.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16
}

// MARK: - ControlChannel

/// Write side of the control socket. Sends are fire-and-forget.
///
/// `closer` is a second handle on the same socket so `shutdown` never waits
/// behind a send that is stuck on a full socket buffer.
#[derive(Debug)]
pub struct ControlChannel {
    stream: Mutex<TcpStream>,
    closer: std::net::TcpStream,
    connected: AtomicBool,
}

impl ControlChannel {
    /// Connect with Nagle disabled; input latency is user-visible.
    pub async fn connect(port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(loopback(port)).await?;
        stream.set_nodelay(true)?;
        let std_stream = stream.into_std()?;
        let closer = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;
        debug!("Control socket connected on port {}", port);
        Ok(Self { stream: Mutex::new(stream), closer, connected: AtomicBool::new(true) })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Write one message. A failed write marks the channel disconnected.
    pub async fn send(&self, msg: &ControlMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let bytes = msg.encode();
        let mut stream = self.stream.lock().await;
        if let Err(e) = stream.write_all(&bytes).await {
            self.connected.store(false, Ordering::Release);
            warn!("Control write failed: {}", e);
            return Err(TransportError::SendFailed { reason: e.to_string() });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn inject_touch(
        &self,
        action: TouchAction,
        pointer_id: i64,
        x: i32,
        y: i32,
        screen_width: u16,
        screen_height: u16,
        pressure: f32,
        action_button: i32,
        buttons: i32,
    ) -> Result<(), TransportError> {
        self.send(&ControlMessage::InjectTouch {
            action,
            pointer_id,
            x,
            y,
            screen_width,
            screen_height,
            pressure,
            action_button,
            buttons,
        })
        .await
    }

    pub async fn inject_key(&self, action: KeyAction, keycode: i32, meta_state: i32) -> Result<(), TransportError> {
        self.send(&ControlMessage::InjectKeycode { action, keycode, meta_state }).await
    }

    /// Type arbitrary text through the device clipboard. Empty text is a no-op.
    pub async fn inject_text(&self, text: &str) -> Result<(), TransportError> {
        if text.is_empty() {
            return Ok(());
        }
        self.send(&ControlMessage::SetClipboard { text: text.to_owned(), paste: true }).await
    }

    pub async fn rotate(&self) -> Result<(), TransportError> {
        self.send(&ControlMessage::RotateDevice).await
    }

    /// Close the socket without taking the write lock. A send blocked on a
    /// stalled peer fails with `SendFailed`; later sends fail with `NotConnected`.
    pub fn shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        if let Err(e) = self.closer.shutdown(std::net::Shutdown::Both) {
            debug!("Control shutdown: {}", e);
        }
    }
}

// MARK: - Tests
