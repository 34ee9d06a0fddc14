//! Video socket: handshake on the async side, framed packets on the blocking side.

use std::io::Read;
use std::time::Duration;

use bytes::BytesMut;
use droidlink_core::{EncodedPacket, Resolution, TransportError, VideoCodec};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::{loopback, DEVICE_NAME_LEN, HEADER_LEN, MAX_PACKET_SIZE};

// ── VideoChannel ──────────────────────────────────────────────────────────────

/// Connected video socket that has passed the dummy-byte check.
#[derive(Debug)]
pub struct VideoChannel {
    stream: TcpStream,
}

impl VideoChannel {
    /// Connect to `127.0.0.1:port` and wait for the server's dummy byte.
    ///
    /// With `adb forward` the local connect succeeds even when nothing is
    /// listening on the device yet; the tunnel is then closed right away or
    /// stays silent. Both cases are reported as errors here.
    pub async fn connect(port: u16, dummy_timeout: Duration) -> Result<Self, TransportError> {
        let mut stream = TcpStream::connect(loopback(port)).await?;

        let mut dummy = [0u8; 1];
        let read = tokio::time::timeout(dummy_timeout, stream.read(&mut dummy))
            .await
            .map_err(|_| TransportError::NoDummyByte { ms: dummy_timeout.as_millis() as u64 })??;
        if read != 1 {
            return Err(TransportError::ShortRead { got: read, expected: 1 });
        }

        debug!("Dummy byte received on port {}: 0x{:02X}", port, dummy[0]);
        Ok(Self { stream })
    }

    /// Read the fixed 64-byte device-name field.
    pub async fn read_device_name(&mut self) -> Result<String, TransportError> {
        let mut buf = [0u8; DEVICE_NAME_LEN];
        let mut filled = 0;
        while filled < DEVICE_NAME_LEN {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransportError::ShortRead { got: filled, expected: DEVICE_NAME_LEN });
            }
            filled += n;
        }
        Ok(decode_device_name(&buf))
    }

    /// Hand the socket over to a blocking reader thread.
    pub fn into_std(self) -> std::io::Result<std::net::TcpStream> {
        let stream = self.stream.into_std()?;
        stream.set_nonblocking(false)?;
        Ok(stream)
    }
}

fn decode_device_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end_matches('\0').to_string()
}

// ── CodecMeta ─────────────────────────────────────────────────────────────────

/// The 12-byte header sent once before the first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecMeta {
    pub codec_id: u32,
    pub width: u32,
    pub height: u32,
}

impl CodecMeta {
    pub fn codec(&self) -> Option<VideoCodec> {
        VideoCodec::from_id(self.codec_id)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

// ── PacketReader ──────────────────────────────────────────────────────────────

/// Outcome of reading one packet header.
#[derive(Debug)]
pub enum PacketRead {
    Packet(EncodedPacket),
    /// The size field was implausible; no payload was consumed.
    Skipped { size: i32 },
}

/// Blocking reader for the codec header and framed packets.
///
/// A corrupt size field skips exactly one header. Resynchronisation relies
/// on the transport never losing byte alignment.
pub struct PacketReader<R> {
    inner: R,
    header: [u8; HEADER_LEN],
    packets: u64,
}

impl<R: Read> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, header: [0u8; HEADER_LEN], packets: 0 }
    }

    pub fn read_codec_meta(&mut self) -> Result<CodecMeta, TransportError> {
        read_full(&mut self.inner, &mut self.header)?;
        let h = &self.header;
        Ok(CodecMeta {
            codec_id: u32::from_be_bytes([h[0], h[1], h[2], h[3]]),
            width: u32::from_be_bytes([h[4], h[5], h[6], h[7]]),
            height: u32::from_be_bytes([h[8], h[9], h[10], h[11]]),
        })
    }

    pub fn next_packet(&mut self) -> Result<PacketRead, TransportError> {
        read_full(&mut self.inner, &mut self.header)?;
        self.packets += 1;

        let mut pts_raw = [0u8; 8];
        pts_raw.copy_from_slice(&self.header[..8]);
        let raw_pts = u64::from_be_bytes(pts_raw);
        let size = i32::from_be_bytes([self.header[8], self.header[9], self.header[10], self.header[11]]);

        if size <= 0 || size as usize > MAX_PACKET_SIZE {
            return Ok(PacketRead::Skipped { size });
        }

        let mut payload = BytesMut::zeroed(size as usize);
        read_full(&mut self.inner, &mut payload)?;
        trace!("Packet #{}: raw_pts={:#x} size={}", self.packets, raw_pts, size);

        Ok(PacketRead::Packet(EncodedPacket::from_wire(raw_pts, payload.freeze())))
    }

    /// Headers read so far, skipped ones included.
    pub fn packets_read(&self) -> u64 {
        self.packets
    }
}

/// Fill `buf` completely; a zero-length read is an end-of-stream error.
///
/// `Read::read_exact` would lose how many bytes arrived before the peer
/// closed, which `ShortRead` reports.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(TransportError::ShortRead { got: filled, expected: buf.len() }),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
