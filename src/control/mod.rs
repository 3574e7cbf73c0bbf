//! Remote control over MQTT
//!
//! The node subscribes to `opensentry/<id>/command` and reports on
//! `opensentry/<id>/status`. Commands only touch the shared [`RunState`].

pub mod heartbeat;
pub mod mqtt;

use crate::utils::status::{NodeStatus, RunState};
use std::fmt;
use thiserror::Error;

pub use heartbeat::Heartbeat;
pub use mqtt::ControlChannel;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("could not connect to broker {broker}: {reason}")]
    Connect { broker: String, reason: String },
    #[error("broker request failed: {0}")]
    Request(#[from] rumqttc::ClientError),
    #[error("network thread: {0}")]
    Thread(#[from] std::io::Error),
    #[error("control channel closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Shutdown,
}

impl Command {
    /// Parses a command payload. Anything but the exact keywords is `None`.
    pub fn parse(payload: &[u8]) -> Option<Command> {
        match payload {
            b"start" => Some(Command::Start),
            b"stop" => Some(Command::Stop),
            b"shutdown" => Some(Command::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Shutdown => "shutdown",
        })
    }
}

/// Applies `command` and returns the status discovery should advertise.
pub fn apply_command(command: Command, run_state: &RunState) -> NodeStatus {
    match command {
        Command::Start => {
            run_state.set_streaming(true);
            NodeStatus::Streaming
        }
        Command::Stop => {
            run_state.set_streaming(false);
            NodeStatus::Idle
        }
        Command::Shutdown => {
            run_state.shutdown();
            NodeStatus::Offline
        }
    }
}

/// Called with the status resulting from each applied command.
pub type StatusCallback = Box<dyn Fn(NodeStatus) + Send>;

/// Where status values get published.
pub trait StatusPublisher: Send + Sync {
    fn is_connected(&self) -> bool;

    fn publish_status(&self, status: NodeStatus) -> Result<(), ControlError>;
}
