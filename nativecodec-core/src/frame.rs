//! Decoded frame views handed to the sink.

use crate::clock::FrameTiming;
use serde::{Deserialize, Serialize};

/// Pixel layout of decoder output buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Nv12,  // 4:2:0 semi-planar (Y plane + interleaved UV)
    I420,  // 4:2:0 planar
    Rgba8, // 8-bit RGBA
}

impl PixelFormat {
    /// Bytes needed for a tightly packed frame of this format
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            Self::Nv12 | Self::I420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
            Self::Rgba8 => w * h * 4,
        }
    }

    /// Bytes per row of the first plane
    pub fn min_stride(&self, width: u32) -> u32 {
        match self {
            Self::Nv12 | Self::I420 => width,
            Self::Rgba8 => width * 4,
        }
    }
}

/// Dimensions and layout of the frames the decoder currently produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            stride: format.min_stride(width),
            format,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.format.buffer_size(self.width, self.height)
    }
}

/// A decoded frame borrowed from a decoder output buffer.
///
/// Only valid for the duration of the sink call; the buffer goes back to the
/// decoder right after.
#[derive(Debug)]
pub struct VideoFrame<'a> {
    /// Raw pixel data as produced by the decoder
    pub data: &'a [u8],
    pub geometry: FrameGeometry,
    /// Presentation timestamp (microseconds)
    pub pts_us: i64,
    /// Schedule position computed by the presentation clock
    pub timing: FrameTiming,
    /// Delivery counter within the session
    pub sequence: u64,
    /// Last frame before end of stream
    pub end_of_stream: bool,
}

impl<'a> VideoFrame<'a> {
    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    /// Luma plane, if the buffer is large enough to hold one
    pub fn luma(&self) -> Option<&'a [u8]> {
        let len = self.geometry.stride as usize * self.geometry.height as usize;
        match self.geometry.format {
            PixelFormat::Nv12 | PixelFormat::I420 => self.data.get(..len),
            PixelFormat::Rgba8 => None,
        }
    }
}
