//! H.264 encoding
//!
//! The pipeline drives an encoder through [`FrameEncoder`]: convert the
//! captured frame, submit it with a presentation counter, then poll until
//! the encoder reports it has nothing more to give.

pub mod ffmpeg;
mod frame_pool;

use crate::capture::CapturedFrame;
use crate::pipeline::types::{MediaPacket, TimeBase};
use thiserror::Error;

pub use ffmpeg::FfmpegEncoder;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Ffmpeg(#[from] ac_ffmpeg::Error),
    #[error("no H.264 encoder available (tried {0})")]
    Unavailable(String),
    #[error("frame is {got:?}, encoder expects {expected:?}")]
    Geometry {
        got: (u32, u32),
        expected: (u32, u32),
    },
    #[error("captured frame holds {got} bytes, {needed} needed")]
    ShortFrame { got: usize, needed: usize },
    #[error("encoder was already flushed")]
    Flushed,
}

/// Encoder settings derived from the negotiated capture format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl EncoderParams {
    pub fn time_base(&self) -> TimeBase {
        TimeBase::new(1, self.fps as i32)
    }

    /// Keyframe interval, two seconds of video.
    pub fn gop(&self) -> u32 {
        self.fps * 2
    }
}

/// Result of one poll of the encoder.
#[derive(Debug, PartialEq, Eq)]
pub enum EncoderOutput {
    Packet(MediaPacket),
    /// Nothing more until the next frame is submitted
    WouldBlock,
    /// Drained after a flush
    EndOfStream,
}

pub trait FrameEncoder {
    /// Frame representation the encoder consumes after conversion.
    type Input;

    /// Timebase of submitted pts values and emitted packets.
    fn time_base(&self) -> TimeBase;

    /// Converts a captured frame to the encoder's pixel format.
    fn convert(&mut self, frame: &CapturedFrame) -> Result<Self::Input, EncodeError>;

    fn submit(&mut self, input: Self::Input, pts: i64) -> Result<(), EncodeError>;

    fn poll(&mut self) -> Result<EncoderOutput, EncodeError>;

    /// Signals end of stream. Later polls drain what is buffered.
    fn flush(&mut self) -> Result<(), EncodeError>;
}
