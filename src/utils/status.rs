use crate::utils::sos::SignalOfStop;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Status values published on the control channel and advertised over discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Online,
    Streaming,
    Idle,
    Offline,
    ErrorNoCamera,
    ErrorNoRtspServer,
    ErrorStreamInit,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Streaming => "streaming",
            NodeStatus::Idle => "idle",
            NodeStatus::Offline => "offline",
            NodeStatus::ErrorNoCamera => "error_no_camera",
            NodeStatus::ErrorNoRtspServer => "error_no_rtsp_server",
            NodeStatus::ErrorStreamInit => "error_stream_init",
        }
    }

    /// Heartbeat value for the given streaming flag.
    pub fn from_streaming(streaming: bool) -> Self {
        if streaming {
            NodeStatus::Streaming
        } else {
            NodeStatus::Idle
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-state flags shared by the pipeline, control channel and heartbeat.
///
/// `streaming` toggles freely. `running` goes from true to false exactly once.
/// The two flags are independent: no ordering between them is implied.
pub struct RunState {
    streaming: Arc<AtomicBool>,
    running: SignalOfStop,
}

impl RunState {
    pub fn new(streaming: bool) -> RunState {
        RunState {
            streaming: Arc::new(AtomicBool::new(streaming)),
            running: SignalOfStop::new(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn set_streaming(&self, value: bool) {
        self.streaming.store(value, Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.running.cancelled()
    }

    /// Terminal transition. Returns `true` for the call that performed it.
    pub fn shutdown(&self) -> bool {
        self.running.cancel()
    }

    /// Sleeps up to `timeout`, returning early (with `true`) once shut down.
    pub fn wait_shutdown(&self, timeout: Duration) -> bool {
        self.running.wait_timeout(timeout)
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Clone for RunState {
    fn clone(&self) -> RunState {
        RunState {
            streaming: Arc::clone(&self.streaming),
            running: self.running.clone(),
        }
    }
}
