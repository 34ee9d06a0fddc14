use std::sync::{Arc, Mutex, MutexGuard};

use droidlink_core::{DecodedFrame, DecoderError, Resolution};
use droidlink_decoder::FrameConverter;
use thiserror::Error;
use tracing::{debug, info};

// MARK: - Renderer trait

/// Destination of decoded frames. One instance per session, driven from the
/// decode thread.
pub trait Renderer: Send {
    /// Convert and publish one frame.
    fn present(&mut self, frame: &DecodedFrame) -> Result<(), RendererError>;

    /// Forget size-dependent state; the next frame reinitializes it.
    fn reset(&mut self);
}

/// Creates a renderer when a session reaches the decode stage.
pub trait RendererFactory: Send + Sync {
    fn create(&self) -> Box<dyn Renderer>;
}

// MARK: - RendererError

#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Frame conversion failed: {0}")]
    Convert(#[from] DecoderError),

    #[error("Frame has zero size ({0})")]
    EmptyFrame(Resolution),
}

// MARK: - FrameBuffer

/// Last presented picture as interleaved BGRA.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row.
    pub stride: usize,
    pub pts_us: u64,
    /// Frames presented since the buffer was created.
    pub frame_count: u64,
}

impl FrameBuffer {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn reshape(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.stride = width as usize * 4;
        self.pixels.clear();
        self.pixels.resize(self.stride * height as usize, 0);
    }
}

// MARK: - SharedFrame

/// Handle the presentation layer reads from. Cloning shares the buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedFrame {
    inner: Arc<Mutex<FrameBuffer>>,
}

impl SharedFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, FrameBuffer> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current picture, `None` before the first frame.
    pub fn snapshot(&self) -> Option<FrameBuffer> {
        let buf = self.lock();
        (!buf.is_empty()).then(|| buf.clone())
    }

    pub fn frame_count(&self) -> u64 {
        self.lock().frame_count
    }
}

impl RendererFactory for SharedFrame {
    fn create(&self) -> Box<dyn Renderer> {
        Box::new(BufferRenderer::new(self.clone()))
    }
}

// MARK: - BufferRenderer

/// Converts each frame straight into a [`SharedFrame`].
pub struct BufferRenderer {
    target: SharedFrame,
    converter: Option<FrameConverter>,
}

impl BufferRenderer {
    pub fn new(target: SharedFrame) -> Self {
        Self { target, converter: None }
    }
}

impl Renderer for BufferRenderer {
    fn present(&mut self, frame: &DecodedFrame) -> Result<(), RendererError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(RendererError::EmptyFrame(frame.resolution()));
        }

        let mut converter = match self.converter.take() {
            Some(conv) if conv.matches(frame.width, frame.height) => conv,
            previous => {
                if previous.is_some() {
                    info!("Frame size changed to {}x{}", frame.width, frame.height);
                } else {
                    debug!("Renderer initialised for {}x{}", frame.width, frame.height);
                }
                FrameConverter::new(frame.width, frame.height, frame.width, frame.height)?
            }
        };

        let (w, h) = converter.output_size();
        let result = {
            let mut buf = self.target.lock();
            if buf.width != w || buf.height != h {
                buf.reshape(w, h);
            }
            let stride = buf.stride;
            let converted = converter.convert(frame, &mut buf.pixels, stride);
            if converted.is_ok() {
                buf.pts_us = frame.timestamp_us;
                buf.frame_count += 1;
            }
            converted
        };
        self.converter = Some(converter);
        result.map_err(RendererError::from)
    }

    fn reset(&mut self) {
        self.converter = None;
    }
}
