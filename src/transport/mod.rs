//! Output transport towards the RTSP relay
//!
//! A transport goes through the same steps a muxer does: its context is
//! allocated for a target URL, then I/O is opened, a header is written,
//! packets are written interleaved, a trailer is written and it is closed.

pub mod rtp;
pub mod rtsp;

use crate::pipeline::types::{MediaPacket, TimeBase};
use thiserror::Error;

pub use rtsp::RtspPublisher;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid stream URL '{0}'")]
    InvalidUrl(String),
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{method} rejected: {code} {reason}")]
    Status {
        method: &'static str,
        code: u16,
        reason: String,
    },
    #[error("rtp payload: {0}")]
    Payload(#[from] webrtc::rtp::Error),
    #[error("rtp packet: {0}")]
    Marshal(#[from] webrtc::util::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("stream {stream}: dts {dts} after {last}")]
    NonMonotonic { stream: usize, last: i64, dts: i64 },
    #[error("transport is not recording")]
    NotRecording,
}

/// The single video stream carried by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub index: usize,
    pub time_base: TimeBase,
}

pub trait StreamTransport {
    fn descriptor(&self) -> StreamDescriptor;

    /// Connects to the target.
    fn open_io(&mut self) -> Result<(), TransportError>;

    /// Negotiates the session. Packets may be written after this succeeds.
    fn write_header(&mut self) -> Result<(), TransportError>;

    /// Writes one packet whose timing is already in the descriptor's time base.
    fn write_packet(&mut self, packet: &MediaPacket) -> Result<(), TransportError>;

    fn write_trailer(&mut self) -> Result<(), TransportError>;

    /// Releases the connection. Safe to call more than once.
    fn close(&mut self);
}
