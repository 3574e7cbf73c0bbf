//! Core types for the pipeline system

use bytes::Bytes;

/// Unit fraction mapping integer timestamps to seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Rescale `ts` from this time base into `to`, rounding to nearest
    /// with halfway cases away from zero.
    pub fn rescale(&self, ts: i64, to: TimeBase) -> i64 {
        let num = ts as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        let half = den / 2;
        let scaled = if num >= 0 {
            (num + half) / den
        } else {
            -((-num + half) / den)
        };
        scaled as i64
    }
}

impl std::fmt::Display for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Encoded video packet with timing in `time_base`.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaPacket {
    /// H.264 Annex B access unit
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub time_base: TimeBase,
    pub stream_index: usize,
    pub is_keyframe: bool,
}

impl MediaPacket {
    /// Rescale pts/dts into another time base.
    pub fn with_time_base(mut self, time_base: TimeBase) -> Self {
        self.pts = self.time_base.rescale(self.pts, time_base);
        self.dts = self.time_base.rescale(self.dts, time_base);
        self.time_base = time_base;
        self
    }

    pub fn with_stream_index(mut self, index: usize) -> Self {
        self.stream_index = index;
        self
    }

    /// Get the size of the packet data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for MediaPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPacket")
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("time_base", &self.time_base)
            .field("stream_index", &self.stream_index)
            .field("is_keyframe", &self.is_keyframe)
            .field("size", &self.size())
            .finish()
    }
}
