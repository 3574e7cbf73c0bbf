//! Counters for the capture-encode-transmit loop

use std::time::{Duration, Instant};

/// Per-session counters, owned by the pipeline thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames read from the device
    pub frames_captured: u64,
    /// Frames handed to the encoder
    pub frames_sent: u64,
    /// Sent frames that reused the retained buffer
    pub frames_frozen: u64,
    /// Iterations with nothing retained yet
    pub frames_skipped: u64,
    pub packets_written: u64,
    pub bytes_written: u64,
    pub keyframes_written: u64,
}

impl PipelineStats {
    pub fn record_capture(&mut self) {
        self.frames_captured += 1;
    }

    pub fn record_sent(&mut self, frozen: bool) {
        self.frames_sent += 1;
        if frozen {
            self.frames_frozen += 1;
        }
    }

    pub fn record_skip(&mut self) {
        self.frames_skipped += 1;
    }

    pub fn record_packet(&mut self, size: usize, is_keyframe: bool) {
        self.packets_written += 1;
        self.bytes_written += size as u64;
        if is_keyframe {
            self.keyframes_written += 1;
        }
    }
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} captured, {} sent ({} frozen, {} skipped), {} packets, {} bytes, {} keyframes",
            self.frames_captured,
            self.frames_sent,
            self.frames_frozen,
            self.frames_skipped,
            self.packets_written,
            self.bytes_written,
            self.keyframes_written
        )
    }
}

/// Logs a stats line at a fixed interval.
pub struct StatsReporter {
    interval: Duration,
    last: Instant,
}

impl StatsReporter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// Logs `stats` if the interval elapsed since the last report.
    pub fn tick(&mut self, stats: &PipelineStats) -> bool {
        if self.last.elapsed() < self.interval {
            return false;
        }
        self.last = Instant::now();
        log::info!("Pipeline: {}", stats);
        true
    }
}
