use super::{DiscoveryError, ServiceRecord};
use crossbeam_channel::Sender;

/// Lifecycle of the underlying discovery client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Running,
    Failure,
}

/// Outcome notifications for the committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Established,
    Collision,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Client(ClientState),
    Group(GroupEvent),
}

#[derive(Debug)]
pub(crate) enum LoopMessage {
    Backend(BackendEvent),
    Stop,
}

/// Where a backend posts its notifications. Cheap to clone into callback threads.
#[derive(Clone)]
pub struct EventSink(pub(crate) Sender<LoopMessage>);

impl EventSink {
    pub fn emit(&self, event: BackendEvent) {
        if self.0.send(LoopMessage::Backend(event)).is_err() {
            log::debug!("Discovery: event loop gone, dropping notification");
        }
    }
}

/// A service advertisement mechanism. Only ever called with the
/// broadcaster's lock held.
pub trait DiscoveryBackend: Send {
    /// Registers `record`.
    fn commit(&mut self, record: &ServiceRecord) -> Result<(), DiscoveryError>;

    /// Withdraws the committed entry, if any.
    fn reset(&mut self) -> Result<(), DiscoveryError>;

    fn shutdown(&mut self);
}
