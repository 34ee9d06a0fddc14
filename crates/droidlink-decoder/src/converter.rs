//! Planar I420 → interleaved BGRA with bilinear scaling, via `GstVideoConverter`.
//!
//! Colour conversion uses BT.601 limited range, which is what Android
//! hardware encoders emit.

use std::fmt;

use droidlink_core::{DecodedFrame, DecoderError, PixelFormat};
use gstreamer as gst;
use gstreamer_video as gst_video;
use gstreamer_video::{
    VideoColorMatrix, VideoColorPrimaries, VideoColorRange, VideoColorimetry, VideoConverterConfig,
    VideoDitherMethod, VideoFormat, VideoFrame, VideoFrameExt, VideoInfo, VideoResamplerMethod, VideoTransferFunction,
};

fn convert_error(reason: impl fmt::Display) -> DecoderError {
    DecoderError::DecodeFailed { reason: reason.to_string() }
}

// MARK: - FrameConverter

/// Reusable converter for one source/destination size pair.
///
/// Owns the BGRA output buffer, so steady-state frames allocate nothing
/// unless the decoder's plane layout differs from GStreamer's default I420.
pub struct FrameConverter {
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
    in_info: VideoInfo,
    out_info: VideoInfo,
    converter: gst_video::VideoConverter,
    output: Option<gst::Buffer>,
}

impl fmt::Debug for FrameConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameConverter")
            .field("src", &(self.src_w, self.src_h))
            .field("dst", &(self.dst_w, self.dst_h))
            .finish()
    }
}

impl FrameConverter {
    pub fn new(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Result<Self, DecoderError> {
        gst::init().map_err(|e| DecoderError::Pipeline(e.to_string()))?;

        let bt601 = VideoColorimetry::new(
            VideoColorRange::Range16_235,
            VideoColorMatrix::Bt601,
            VideoTransferFunction::Bt709,
            VideoColorPrimaries::Smpte170m,
        );
        let in_info = VideoInfo::builder(VideoFormat::I420, src_w.max(1), src_h.max(1))
            .colorimetry(&bt601)
            .build()
            .map_err(convert_error)?;
        let out_info = VideoInfo::builder(VideoFormat::Bgra, dst_w.max(1), dst_h.max(1))
            .build()
            .map_err(convert_error)?;

        let mut config = VideoConverterConfig::new();
        config.set_resampler_method(VideoResamplerMethod::Linear);
        config.set_chroma_resampler_method(VideoResamplerMethod::Linear);
        config.set_dither_method(VideoDitherMethod::None);
        let converter = gst_video::VideoConverter::new(&in_info, &out_info, Some(config)).map_err(convert_error)?;

        Ok(Self { src_w, src_h, dst_w, dst_h, in_info, out_info, converter, output: None })
    }

    /// Whether this converter was built for a source of `width` × `height`.
    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.src_w == width && self.src_h == height
    }

    pub fn output_size(&self) -> (u32, u32) {
        (self.dst_w, self.dst_h)
    }

    /// Write the frame into `dst` as BGRA rows of `dst_stride` bytes.
    /// Bytes past `dst_w * 4` in each row are left untouched.
    pub fn convert(&mut self, frame: &DecodedFrame, dst: &mut [u8], dst_stride: usize) -> Result<(), DecoderError> {
        if frame.format != PixelFormat::I420 {
            return Err(convert_error(format!("expected I420, got {:?}", frame.format)));
        }
        if !self.matches(frame.width, frame.height) {
            return Err(convert_error(format!(
                "converter built for {}x{}, frame is {}x{}",
                self.src_w, self.src_h, frame.width, frame.height
            )));
        }
        let row_bytes = self.dst_w as usize * 4;
        if dst_stride < row_bytes || dst.len() < dst_stride * self.dst_h.saturating_sub(1) as usize + row_bytes {
            return Err(convert_error("destination buffer too small"));
        }
        self.check_planes(frame)?;

        let src = VideoFrame::from_buffer_readable(self.source_buffer(frame), &self.in_info)
            .map_err(|_| convert_error("source frame map failed"))?;

        let output = match self.output.take() {
            Some(buffer) => buffer,
            None => gst::Buffer::with_size(self.out_info.size()).map_err(convert_error)?,
        };
        let mut out = match VideoFrame::from_buffer_writable(output, &self.out_info) {
            Ok(out) => out,
            Err(buffer) => {
                self.output = Some(buffer);
                return Err(convert_error("output frame map failed"));
            }
        };

        self.converter.frame(&src, &mut out);

        let copied = copy_rows(&out, dst, dst_stride, row_bytes, self.dst_h as usize);
        self.output = Some(out.into_buffer());
        copied
    }

    /// Every plane must hold `rows` lines of at least `width` bytes.
    fn check_planes(&self, frame: &DecodedFrame) -> Result<(), DecoderError> {
        for (i, (w, h)) in self.plane_sizes().into_iter().enumerate() {
            let stride = frame.strides[i];
            let needed = stride * h.saturating_sub(1) + w;
            if stride < w || frame.data.len() < frame.offsets[i] + needed {
                return Err(convert_error(format!("plane {i} truncated")));
            }
        }
        Ok(())
    }

    /// Wrap the frame without copying when it already has the default I420
    /// layout, otherwise repack its planes into that layout.
    fn source_buffer(&self, frame: &DecodedFrame) -> gst::Buffer {
        let offsets = self.in_info.offset();
        let strides = self.in_info.stride();
        let same_layout = (0..3).all(|i| {
            offsets.get(i) == Some(&frame.offsets[i]) && strides.get(i).map(|s| *s as usize) == Some(frame.strides[i])
        });
        if same_layout && frame.data.len() >= self.in_info.size() {
            return gst::Buffer::from_slice(frame.data.clone());
        }

        let mut packed = vec![0u8; self.in_info.size()];
        for (i, (w, h)) in self.plane_sizes().into_iter().enumerate() {
            let dst_offset = offsets.get(i).copied().unwrap_or(0);
            let dst_stride = strides.get(i).copied().unwrap_or(0).max(0) as usize;
            for row in 0..h {
                let from = frame.offsets[i] + row * frame.strides[i];
                let to = dst_offset + row * dst_stride;
                packed[to..to + w].copy_from_slice(&frame.data[from..from + w]);
            }
        }
        gst::Buffer::from_mut_slice(packed)
    }

    fn plane_sizes(&self) -> [(usize, usize); 3] {
        let (w, h) = (self.src_w as usize, self.src_h as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        [(w, h), (cw, ch), (cw, ch)]
    }
}

fn copy_rows(
    out: &VideoFrame<gst_video::video_frame::Writable>,
    dst: &mut [u8],
    dst_stride: usize,
    row_bytes: usize,
    rows: usize,
) -> Result<(), DecoderError> {
    let data = out.plane_data(0).map_err(convert_error)?;
    let stride = out.plane_stride()[0].max(0) as usize;
    for row in 0..rows {
        dst[row * dst_stride..row * dst_stride + row_bytes]
            .copy_from_slice(&data[row * stride..row * stride + row_bytes]);
    }
    Ok(())
}
