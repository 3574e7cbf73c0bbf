use bytes::Bytes;
use log::{info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::video::capture::Parameters;
use v4l::{Device, FourCC};

use crate::assets::CAPTURE_BUFFERS;
use crate::capture::{CaptureError, CapturedFrame, FrameSource, PixelLayout};
use crate::config::DeviceSelector;

/// V4L2 camera streaming through memory-mapped buffers.
pub struct V4lCamera {
    // declared before the device so the buffers are unmapped first
    stream: MmapStream<'static>,
    _device: Device,
    path: String,
    width: u32,
    height: u32,
    stride: usize,
    layout: PixelLayout,
}

impl V4lCamera {
    /// Opens the device and negotiates YUYV at its current resolution.
    pub fn open(selector: &DeviceSelector, fps: u32) -> Result<Self, CaptureError> {
        let path = selector.path();
        let open_err = |source: std::io::Error| CaptureError::Open {
            device: path.clone(),
            source,
        };

        let device = Device::new(selector.index() as usize).map_err(open_err)?;

        let mut format = device.format().map_err(open_err)?;
        format.fourcc = FourCC::new(b"YUYV");
        let format = device.set_format(&format).map_err(open_err)?;
        let layout = PixelLayout::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            CaptureError::Format(format!("{} offers {} only", path, format.fourcc))
        })?;

        if let Err(e) = device.set_params(&Parameters::with_fps(fps)) {
            warn!("Camera: could not request {} fps on {}: {}", fps, path, e);
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, CAPTURE_BUFFERS)
            .map_err(open_err)?;

        let stride = if format.stride > 0 {
            format.stride as usize
        } else {
            match layout {
                PixelLayout::Yuyv422 => format.width as usize * 2,
                PixelLayout::Nv12 => format.width as usize,
            }
        };

        info!(
            "Camera: opened {} ({}x{} {})",
            path,
            format.width,
            format.height,
            layout.ffmpeg_name()
        );

        Ok(Self {
            stream,
            _device: device,
            path,
            width: format.width,
            height: format.height,
            stride,
            layout,
        })
    }
}

impl FrameSource for V4lCamera {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read(&mut self) -> Result<CapturedFrame, CaptureError> {
        let (buffer, meta) = self.stream.next()?;
        let used = (meta.bytesused as usize).min(buffer.len());
        if used == 0 {
            return Err(CaptureError::Empty);
        }

        Ok(CapturedFrame {
            width: self.width,
            height: self.height,
            stride: self.stride,
            layout: self.layout,
            sequence: meta.sequence as u64,
            data: Bytes::copy_from_slice(&buffer[..used]),
        })
    }
}

impl Drop for V4lCamera {
    fn drop(&mut self) {
        info!("Camera: released {}", self.path);
    }
}
