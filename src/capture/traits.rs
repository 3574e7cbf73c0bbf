//! Traits for camera capture functionality

use super::{CaptureError, CapturedFrame};

/// A blocking source of live frames.
///
/// Dropping the source releases the underlying device.
pub trait FrameSource {
    /// Intrinsic (width, height) negotiated with the device.
    fn resolution(&self) -> (u32, u32);

    /// Blocks until the device delivers the next frame.
    ///
    /// An empty buffer is reported as [`CaptureError::Empty`].
    fn read(&mut self) -> Result<CapturedFrame, CaptureError>;
}
