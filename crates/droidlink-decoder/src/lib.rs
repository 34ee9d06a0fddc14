//! droidlink-decoder — H.264 decoding for the mirrored screen
//!
//! # Decoder priority
//! 1. `vaapih264dec`   — AMD/Intel VA-API
//! 2. `vaapidecodebin` — VA-API auto-select
//! 3. `nvh264dec`      — NVIDIA NVDEC
//! 4. `avdec_h264`     — software libavcodec, last resort
//!
//! # Pipeline
//! ```text
//! appsrc → h264parse → [decoder] → videoconvert → video/x-raw,format=I420 → appsink
//! ```
//! The device server sends Annex-B access units; `h264parse` only re-aligns.
//! Frames leave the pipeline as I420 and are turned into BGRA by
//! [`FrameConverter`] on the renderer side.

mod converter;

use bytes::{Bytes, BytesMut};
use droidlink_core::{DecodedFrame, DecoderError, EncodedPacket, PixelFormat};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSrc};
use gstreamer_video::VideoInfo;
use tracing::{debug, info, warn};

pub use converter::FrameConverter;

// MARK: - Traits

/// One decoder instance, owned by a session's decode thread.
pub trait FrameDecoder: Send {
    /// Feed one access unit. `Ok(None)` means no picture is ready yet.
    fn decode(&mut self, packet: &EncodedPacket) -> Result<Option<DecodedFrame>, DecoderError>;

    fn name(&self) -> &str;
}

/// Creates a fresh decoder for every session (and every reconnect).
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FrameDecoder>, DecoderError>;
}

/// Decoder candidates in priority order.
static DECODER_PRIORITY: &[(&str, &str)] = &[
    ("vaapih264dec", "AMD/Intel VA-API H.264"),
    ("vaapidecodebin", "VA-API auto-select"),
    ("nvh264dec", "NVIDIA NVDEC H.264"),
    ("avdec_h264", "Software libavcodec"),
];

// ── Detection ─────────────────────────────────────────────────────────────────

/// Name of the highest-priority H.264 decoder element installed.
pub fn detect_best_decoder() -> Option<&'static str> {
    if gst::init().is_err() {
        return None;
    }
    for (element, label) in DECODER_PRIORITY {
        if gst::ElementFactory::find(element).is_some() {
            info!("Selected decoder: {} ({})", element, label);
            return Some(element);
        }
        debug!("Decoder '{}' not found, trying next", element);
    }
    None
}

// ── GStreamerDecoder ──────────────────────────────────────────────────────────

/// Synchronous H.264 decoder backed by a GStreamer pipeline.
///
/// Runs on the blocking decode thread; `try_pull_sample` waits.
pub struct GStreamerDecoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    bus: gst::Bus,
    element: &'static str,
    /// SPS/PPS held back until the next picture packet.
    pending_config: Option<Bytes>,
    pull_timeout: gst::ClockTime,
    frames_out: u64,
}

impl GStreamerDecoder {
    /// Build and start the pipeline. Calls `gst::init()` if needed.
    pub fn new(element: &'static str) -> Result<Self, DecoderError> {
        gst::init().map_err(|e| DecoderError::Pipeline(e.to_string()))?;

        let pipeline_str = format!(
            "appsrc name=src format=time is-live=true \
             ! h264parse \
             ! {element} \
             ! videoconvert \
             ! video/x-raw,format=I420 \
             ! appsink name=sink sync=false max-buffers=4 drop=true"
        );

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| DecoderError::Pipeline(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| DecoderError::Pipeline("Not a pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .and_then(|element| element.downcast::<AppSrc>().ok())
            .ok_or_else(|| DecoderError::Pipeline("No appsrc".into()))?;

        let appsink = pipeline
            .by_name("sink")
            .and_then(|element| element.downcast::<AppSink>().ok())
            .ok_or_else(|| DecoderError::Pipeline("No appsink".into()))?;

        let bus = pipeline.bus().ok_or_else(|| DecoderError::Pipeline("No bus".into()))?;

        let src_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        appsrc.set_caps(Some(&src_caps));

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|_| DecoderError::Pipeline("Failed to start pipeline".into()))?;

        let decoder = Self {
            pipeline,
            appsrc,
            appsink,
            bus,
            element,
            pending_config: None,
            pull_timeout: gst::ClockTime::from_mseconds(5),
            frames_out: 0,
        };
        info!(
            "GStreamerDecoder({}) ready, hardware accelerated: {}",
            element,
            decoder.is_hardware_accelerated()
        );
        Ok(decoder)
    }

    pub fn is_hardware_accelerated(&self) -> bool {
        self.element != "avdec_h264"
    }

    fn check_bus(&self) -> Result<(), DecoderError> {
        if let Some(msg) = self.bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                return Err(DecoderError::Pipeline(format!(
                    "{} ({})",
                    err.error(),
                    err.debug().map(|d| d.to_string()).unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    fn push(&self, data: Bytes, pts_us: u64) -> Result<(), DecoderError> {
        let mut buffer = gst::Buffer::from_slice(data);
        buffer.make_mut().set_pts(gst::ClockTime::from_useconds(pts_us));
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| DecoderError::DecodeFailed { reason: format!("appsrc push failed: {e:?}") })?;
        Ok(())
    }

    /// Pull everything the pipeline has ready and keep only the newest.
    fn drain_newest(&self) -> Option<gst::Sample> {
        let mut newest = self.appsink.try_pull_sample(self.pull_timeout)?;
        while let Some(sample) = self.appsink.try_pull_sample(gst::ClockTime::ZERO) {
            newest = sample;
        }
        Some(newest)
    }

    fn sample_to_frame(&self, sample: &gst::Sample, fallback_pts: u64) -> Result<DecodedFrame, DecoderError> {
        let caps = sample
            .caps()
            .ok_or_else(|| DecoderError::DecodeFailed { reason: "sample without caps".into() })?;
        let info = VideoInfo::from_caps(caps)
            .map_err(|e| DecoderError::DecodeFailed { reason: format!("bad caps: {e}") })?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| DecoderError::DecodeFailed { reason: "no buffer in sample".into() })?;
        let map = buffer
            .map_readable()
            .map_err(|_| DecoderError::DecodeFailed { reason: "read map failed".into() })?;

        let offsets = info.offset();
        let strides = info.stride();
        let plane = |i: usize| offsets.get(i).copied().unwrap_or(0);
        let stride = |i: usize| strides.get(i).copied().unwrap_or(0).max(0) as usize;

        Ok(DecodedFrame {
            data: Bytes::copy_from_slice(map.as_slice()),
            width: info.width(),
            height: info.height(),
            timestamp_us: buffer.pts().map(|t| t.useconds()).unwrap_or(fallback_pts),
            format: PixelFormat::I420,
            offsets: [plane(0), plane(1), plane(2)],
            strides: [stride(0), stride(1), stride(2)],
        })
    }
}

impl FrameDecoder for GStreamerDecoder {
    fn decode(&mut self, packet: &EncodedPacket) -> Result<Option<DecodedFrame>, DecoderError> {
        self.check_bus()?;

        if packet.is_config {
            self.pending_config = Some(packet.data.clone());
            return Ok(None);
        }

        let data = match self.pending_config.take() {
            Some(config) => {
                let mut joined = BytesMut::with_capacity(config.len() + packet.data.len());
                joined.extend_from_slice(&config);
                joined.extend_from_slice(&packet.data);
                joined.freeze()
            }
            None => packet.data.clone(),
        };
        self.push(data, packet.pts_us)?;

        let Some(sample) = self.drain_newest() else {
            return Ok(None);
        };
        let frame = self.sample_to_frame(&sample, packet.pts_us)?;
        self.frames_out += 1;
        if self.frames_out == 1 {
            info!("First decoded frame: {}x{}", frame.width, frame.height);
        }
        Ok(Some(frame))
    }

    fn name(&self) -> &str {
        self.element
    }
}

impl Drop for GStreamerDecoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        if self.pipeline.set_state(gst::State::Null).is_err() {
            warn!("GStreamerDecoder({}) did not reach Null state", self.element);
        }
    }
}

// ── GStreamerDecoderFactory ───────────────────────────────────────────────────

/// Detects the element once, then builds a fresh pipeline per session.
#[derive(Debug, Clone, Copy)]
pub struct GStreamerDecoderFactory {
    element: &'static str,
}

impl GStreamerDecoderFactory {
    pub fn detect() -> Result<Self, DecoderError> {
        gst::init().map_err(|e| DecoderError::Pipeline(e.to_string()))?;
        let element = detect_best_decoder().ok_or(DecoderError::Unavailable)?;
        Ok(Self { element })
    }

    pub fn element(&self) -> &'static str {
        self.element
    }
}

impl DecoderFactory for GStreamerDecoderFactory {
    fn create(&self) -> Result<Box<dyn FrameDecoder>, DecoderError> {
        Ok(Box::new(GStreamerDecoder::new(self.element)?))
    }
}
