//! Camera capture module
//!
//! Provides live frames from a V4L2 device on Linux. Other platforms have
//! no capture backend and always fail to open.

#[cfg(target_os = "linux")]
mod device;
#[cfg(target_os = "linux")]
pub use device::V4lCamera;

mod traits;

use bytes::Bytes;
use thiserror::Error;

pub use traits::FrameSource;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("could not open {device}: {source}")]
    Open {
        device: String,
        source: std::io::Error,
    },
    #[error("unsupported capture format: {0}")]
    Format(String),
    #[error("device returned an empty frame")]
    Empty,
    #[error("frame read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("video capture is not supported on this platform")]
    Unsupported,
}

/// Pixel layouts the capture side can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// Packed 4:2:2, two bytes per pixel.
    Yuyv422,
    /// Planar Y followed by interleaved UV at half height.
    Nv12,
}

impl PixelLayout {
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"YUYV" => Some(PixelLayout::Yuyv422),
            b"NV12" => Some(PixelLayout::Nv12),
            _ => None,
        }
    }

    /// Name of the matching FFmpeg pixel format.
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelLayout::Yuyv422 => "yuyv422",
            PixelLayout::Nv12 => "nv12",
        }
    }

    /// Bytes needed for one buffer of this layout at the given stride/height.
    pub fn buffer_len(&self, stride: usize, height: usize) -> usize {
        match self {
            PixelLayout::Yuyv422 => stride * height,
            PixelLayout::Nv12 => stride * height + stride * height.div_ceil(2),
        }
    }
}

/// One frame as delivered by the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane.
    pub stride: usize,
    pub layout: PixelLayout,
    pub sequence: u64,
    pub data: Bytes,
}

impl CapturedFrame {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(not(target_os = "linux"))]
pub struct V4lCamera;

#[cfg(not(target_os = "linux"))]
impl V4lCamera {
    pub fn open(_selector: &crate::config::DeviceSelector, _fps: u32) -> Result<Self, CaptureError> {
        Err(CaptureError::Unsupported)
    }
}

#[cfg(not(target_os = "linux"))]
impl FrameSource for V4lCamera {
    fn resolution(&self) -> (u32, u32) {
        (0, 0)
    }

    fn read(&mut self) -> Result<CapturedFrame, CaptureError> {
        Err(CaptureError::Unsupported)
    }
}
