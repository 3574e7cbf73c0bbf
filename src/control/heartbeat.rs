use crate::control::StatusPublisher;
use crate::utils::status::{NodeStatus, RunState};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Periodically publishes `streaming` or `idle` while the node runs.
pub struct Heartbeat {
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn start(
        publisher: Arc<dyn StatusPublisher>,
        run_state: RunState,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let handle = std::thread::Builder::new()
            .name("heartbeat".into())
            .spawn(move || {
                while run_state.is_running() {
                    if publisher.is_connected() {
                        let status = NodeStatus::from_streaming(run_state.is_streaming());
                        if let Err(e) = publisher.publish_status(status) {
                            log::warn!("Control: heartbeat publish failed: {}", e);
                        }
                    }
                    if run_state.wait_shutdown(interval) {
                        break;
                    }
                }
                log::debug!("Control: heartbeat stopped");
            })?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Waits for the loop to notice `running == false`.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!("Control: heartbeat thread panicked");
        }
    }
}
