use serde::{Deserialize, Serialize};

// MARK: - Resolution

/// Video dimensions as reported by the device server or the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_landscape(&self) -> bool {
        self.width > self.height
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - VideoCodec

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
}

impl VideoCodec {
    /// Codec id as sent in the stream's codec-metadata header (`"h264"` in ASCII).
    pub const H264_ID: u32 = 0x6832_3634;

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            Self::H264_ID => Some(Self::H264),
            _ => None,
        }
    }
}

// MARK: - ConnectionState

/// Session engine state as observed by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Running { serial: String, device_name: String },
    Reconnecting { attempt: u32, max_attempts: u32 },
    CompatFallback,
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Running { .. } => "Running",
            Self::Reconnecting { .. } => "Reconnecting",
            Self::CompatFallback => "Compatibility fallback",
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Idle
    }
}

// MARK: - SessionEvent

/// Notifications pushed from the engine (and its decode thread) to the
/// presentation layer. Consumers apply them on their own thread.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A new frame has been written into the renderer's buffer.
    FrameReady { width: u32, height: u32, pts_us: u64 },
    /// The video flipped between portrait and landscape.
    RotationDetected { width: u32, height: u32 },
    Log(String),
    ConnectionChanged { connected: bool, device_label: Option<String> },
    StateChanged(ConnectionState),
    /// Reconnect attempts (or the compat fallback) were exhausted.
    PermanentDisconnect { reason: String },
}

// MARK: - DecodedFrame

/// Decoded frame, still in the decoder's native planar layout.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub data: bytes::Bytes,
    pub width: u32,
    pub height: u32,
    pub timestamp_us: u64,
    pub format: PixelFormat,
    /// Byte offset of each plane inside `data` (Y, U, V for I420).
    pub offsets: [usize; 3],
    /// Row stride of each plane in bytes.
    pub strides: [usize; 3],
}

impl DecodedFrame {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Allocate a tightly packed I420 frame filled with one YUV color.
    pub fn solid_i420(width: u32, height: u32, y: u8, u: u8, v: u8) -> Self {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);
        let mut data = vec![y; w * h];
        data.extend(std::iter::repeat(u).take(cw * ch));
        data.extend(std::iter::repeat(v).take(cw * ch));
        Self {
            data: bytes::Bytes::from(data),
            width,
            height,
            timestamp_us: 0,
            format: PixelFormat::I420,
            offsets: [0, w * h, w * h + cw * ch],
            strides: [w, cw, cw],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    I420,
}

// MARK: - EncodedPacket

/// One framed access unit read from the video stream.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: bytes::Bytes,
    pub pts_us: u64,
    /// SPS/PPS-only packet sent once after the codec metadata.
    pub is_config: bool,
    pub is_keyframe: bool,
}

impl EncodedPacket {
    pub const FLAG_CONFIG: u64 = 1 << 63;
    pub const FLAG_KEY_FRAME: u64 = 1 << 62;
    pub const PTS_MASK: u64 = Self::FLAG_KEY_FRAME - 1;

    /// Split the raw 64-bit header field into timestamp and flags.
    pub fn from_wire(raw_pts: u64, data: bytes::Bytes) -> Self {
        Self {
            data,
            pts_us: raw_pts & Self::PTS_MASK,
            is_config: raw_pts & Self::FLAG_CONFIG != 0,
            is_keyframe: raw_pts & Self::FLAG_KEY_FRAME != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_flags_are_split_from_pts() {
        let raw = EncodedPacket::FLAG_KEY_FRAME | 123_456;
        let pkt = EncodedPacket::from_wire(raw, bytes::Bytes::from_static(b"x"));
        assert_eq!(pkt.pts_us, 123_456);
        assert!(pkt.is_keyframe);
        assert!(!pkt.is_config);

        let cfg = EncodedPacket::from_wire(EncodedPacket::FLAG_CONFIG, bytes::Bytes::new());
        assert!(cfg.is_config);
        assert_eq!(cfg.pts_us, 0);
    }

    #[test]
    fn codec_id_is_ascii_h264() {
        assert_eq!(&VideoCodec::H264_ID.to_be_bytes(), b"h264");
        assert_eq!(VideoCodec::from_id(0x6832_3634), Some(VideoCodec::H264));
        assert_eq!(VideoCodec::from_id(0x6832_3635), None);
    }

    #[test]
    fn solid_frame_layout() {
        let frame = DecodedFrame::solid_i420(5, 3, 16, 128, 128);
        assert_eq!(frame.strides, [5, 3, 3]);
        assert_eq!(frame.offsets, [0, 15, 21]);
        assert_eq!(frame.data.len(), 27);
    }
}
