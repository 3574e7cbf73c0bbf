//! Local-network announcement of the camera
//!
//! The [`Broadcaster`] owns the service record. Backend notifications are
//! queued and handled by one event-loop thread; every change to the record
//! or the backend happens under the broadcaster's lock.

pub mod backend;
pub mod mdns;

use crate::assets::{COLLISION_BACKOFF_STEP, DISCOVERY_PROTOCOL_MARKER, DISCOVERY_TYPE_MARKER, MAX_NAME_COLLISIONS};
use crate::config::NodeConfig;
use crate::utils::status::NodeStatus;
use backend::LoopMessage;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

pub use backend::{BackendEvent, ClientState, DiscoveryBackend, EventSink, GroupEvent};
pub use mdns::MdnsBackend;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS: {0}")]
    Mdns(#[from] mdns_sd::Error),
    #[error("no local address: {0}")]
    Address(#[from] local_ip_address::Error),
    #[error("event loop: {0}")]
    Thread(#[from] std::io::Error),
}

/// What gets advertised for this camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub camera_id: String,
    /// Instance name, changed on collisions
    pub name: String,
    pub port: u16,
    pub path: String,
    pub status: NodeStatus,
}

impl ServiceRecord {
    pub fn from_config(config: &NodeConfig, status: NodeStatus) -> Self {
        Self {
            camera_id: config.camera_id.clone(),
            name: config.camera_name.clone(),
            port: config.rtsp_port,
            path: config.rtsp_path().to_string(),
            status,
        }
    }

    pub fn txt_properties(&self) -> Vec<(&'static str, String)> {
        vec![
            ("camera_id", self.camera_id.clone()),
            ("name", self.name.clone()),
            ("rtsp_port", self.port.to_string()),
            ("rtsp_path", self.path.clone()),
            ("status", self.status.to_string()),
            ("type", DISCOVERY_TYPE_MARKER.to_string()),
            ("protocol", DISCOVERY_PROTOCOL_MARKER.to_string()),
        ]
    }
}

/// Next name to try after a collision: `Name`, `Name #2`, `Name #3`, ...
pub fn alternative_name(name: &str) -> String {
    if let Some((base, suffix)) = name.rsplit_once(" #")
        && let Ok(n) = suffix.parse::<u32>()
        && n >= 2
    {
        return format!("{} #{}", base, n + 1);
    }
    format!("{} #2", name)
}

struct Inner {
    record: ServiceRecord,
    backend: Box<dyn DiscoveryBackend>,
    client: ClientState,
    committed: bool,
    collisions: u32,
}

impl Inner {
    fn commit(&mut self) {
        match self.backend.commit(&self.record) {
            Ok(()) => self.committed = true,
            Err(e) => {
                self.committed = false;
                warn!("Discovery: could not commit '{}': {}", self.record.name, e);
            }
        }
    }

    fn reset(&mut self) {
        if let Err(e) = self.backend.reset() {
            warn!("Discovery: reset failed: {}", e);
        }
        self.committed = false;
    }
}

pub struct Broadcaster {
    inner: Arc<Mutex<Inner>>,
    events: Sender<LoopMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    /// Starts the mDNS backend and the event loop.
    pub fn start_mdns(record: ServiceRecord) -> Result<Broadcaster, DiscoveryError> {
        Self::start(record, COLLISION_BACKOFF_STEP, MdnsBackend::start)
    }

    /// `make_backend` gets the sink its notifications must go to.
    pub fn start<B, F>(
        record: ServiceRecord,
        backoff_step: Duration,
        make_backend: F,
    ) -> Result<Broadcaster, DiscoveryError>
    where
        B: DiscoveryBackend + 'static,
        F: FnOnce(EventSink) -> Result<B, DiscoveryError>,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let backend = make_backend(EventSink(tx.clone()))?;
        let inner = Arc::new(Mutex::new(Inner {
            record,
            backend: Box::new(backend),
            client: ClientState::Connecting,
            committed: false,
            collisions: 0,
        }));

        let shared = inner.clone();
        let worker = std::thread::Builder::new()
            .name("discovery-events".into())
            .spawn(move || event_loop(shared, rx, backoff_step))?;

        Ok(Broadcaster {
            inner,
            events: tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self) -> ServiceRecord {
        self.lock().record.clone()
    }

    /// Stores `status` and recommits the entry if the client is running,
    /// whatever became of the previous commit. Before that the value is only
    /// stored and goes out with the first commit.
    pub fn update_status(&self, status: NodeStatus) {
        let mut inner = self.lock();
        if inner.record.status == status {
            return;
        }
        inner.record.status = status;
        if inner.client == ClientState::Running {
            inner.reset();
            inner.commit();
            debug!("Discovery: status now {}", status);
        } else {
            debug!("Discovery: status {} deferred until registered", status);
        }
    }

    /// Withdraws the entry and shuts the backend down. Idempotent.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };
        let _ = self.events.send(LoopMessage::Stop);
        if worker.join().is_err() {
            log::error!("Discovery: event loop panicked");
        }

        // the daemon may still hold an entry the broadcaster saw fail
        let mut inner = self.lock();
        inner.reset();
        inner.backend.shutdown();
        info!("Discovery: stopped");
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

fn event_loop(inner: Arc<Mutex<Inner>>, events: Receiver<LoopMessage>, backoff_step: Duration) {
    let lock = || inner.lock().unwrap_or_else(PoisonError::into_inner);

    for message in events.iter() {
        let event = match message {
            LoopMessage::Stop => break,
            LoopMessage::Backend(event) => event,
        };
        match event {
            BackendEvent::Client(ClientState::Running) => {
                let mut inner = lock();
                inner.client = ClientState::Running;
                if !inner.committed {
                    info!("Discovery: client running, registering '{}'", inner.record.name);
                    inner.commit();
                }
            }
            BackendEvent::Client(state) => {
                let mut inner = lock();
                if state == ClientState::Failure {
                    warn!("Discovery: client failed");
                    inner.committed = false;
                }
                debug!("Discovery: client {:?}", state);
                inner.client = state;
            }
            BackendEvent::Group(GroupEvent::Established) => {
                let mut inner = lock();
                inner.collisions = 0;
                debug!("Discovery: '{}' established", inner.record.name);
            }
            BackendEvent::Group(GroupEvent::Collision) => {
                let attempt = {
                    let mut inner = lock();
                    if inner.client == ClientState::Failure {
                        continue;
                    }
                    inner.collisions += 1;
                    if inner.collisions > MAX_NAME_COLLISIONS {
                        warn!(
                            "Discovery: giving up after {} name collisions",
                            MAX_NAME_COLLISIONS
                        );
                        inner.reset();
                        inner.client = ClientState::Failure;
                        continue;
                    }
                    let renamed = alternative_name(&inner.record.name);
                    warn!(
                        "Discovery: name collision on '{}', retrying as '{}'",
                        inner.record.name, renamed
                    );
                    inner.record.name = renamed;
                    inner.reset();
                    inner.collisions
                };

                std::thread::sleep(backoff_step * attempt);

                let mut inner = lock();
                if inner.client == ClientState::Running && !inner.committed {
                    inner.commit();
                }
            }
            BackendEvent::Group(GroupEvent::Failure(reason)) => {
                let mut inner = lock();
                warn!("Discovery: entry failed: {}", reason);
                inner.committed = false;
            }
        }
    }
    debug!("Discovery: event loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Commit(String, NodeStatus),
        CommitRefused,
        Reset,
        Shutdown,
    }

    struct FakeBackend {
        ops: Arc<Mutex<Vec<Op>>>,
        refuse_commit: Arc<AtomicBool>,
    }

    impl DiscoveryBackend for FakeBackend {
        fn commit(&mut self, record: &ServiceRecord) -> Result<(), DiscoveryError> {
            if self.refuse_commit.load(Ordering::SeqCst) {
                self.ops.lock().unwrap().push(Op::CommitRefused);
                return Err(DiscoveryError::Thread(std::io::Error::other("send failed")));
            }
            self.ops
                .lock()
                .unwrap()
                .push(Op::Commit(record.name.clone(), record.status));
            Ok(())
        }

        fn reset(&mut self) -> Result<(), DiscoveryError> {
            self.ops.lock().unwrap().push(Op::Reset);
            Ok(())
        }

        fn shutdown(&mut self) {
            self.ops.lock().unwrap().push(Op::Shutdown);
        }
    }

    fn record() -> ServiceRecord {
        ServiceRecord {
            camera_id: "camera1".into(),
            name: "Porch".into(),
            port: 8554,
            path: "camera1".into(),
            status: NodeStatus::Online,
        }
    }

    fn start() -> (Broadcaster, EventSink, Arc<Mutex<Vec<Op>>>) {
        start_refusing(Arc::new(AtomicBool::new(false)))
    }

    /// Commits fail while `refuse_commit` is set.
    fn start_refusing(
        refuse_commit: Arc<AtomicBool>,
    ) -> (Broadcaster, EventSink, Arc<Mutex<Vec<Op>>>) {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let mut sink = None;
        let backend_ops = ops.clone();
        let broadcaster = Broadcaster::start(record(), Duration::from_millis(1), |events| {
            sink = Some(events);
            Ok(FakeBackend {
                ops: backend_ops,
                refuse_commit,
            })
        })
        .unwrap();
        (broadcaster, sink.unwrap(), ops)
    }

    fn wait_until(what: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !what() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn commits(ops: &Arc<Mutex<Vec<Op>>>) -> usize {
        ops.lock()
            .unwrap()
            .iter()
            .filter(|op| matches!(op, Op::Commit(..)))
            .count()
    }

    #[test]
    fn test_alternative_name() {
        assert_eq!(alternative_name("Porch"), "Porch #2");
        assert_eq!(alternative_name("Porch #2"), "Porch #3");
        assert_eq!(alternative_name("Porch #9"), "Porch #10");
        assert_eq!(alternative_name("Cam #1"), "Cam #1 #2");
        assert_eq!(alternative_name("Lab #x"), "Lab #x #2");
    }

    #[test]
    fn test_txt_properties() {
        let props = record().txt_properties();
        let get = |key: &str| props.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str());
        assert_eq!(get("camera_id"), Some("camera1"));
        assert_eq!(get("rtsp_port"), Some("8554"));
        assert_eq!(get("status"), Some("online"));
        assert_eq!(get("type"), Some("camera"));
        assert_eq!(get("protocol"), Some("rtsp"));
        assert_eq!(props.len(), 7);
    }

    #[test]
    fn test_commits_once_on_first_running() {
        let (broadcaster, sink, ops) = start();
        sink.emit(BackendEvent::Client(ClientState::Connecting));
        sink.emit(BackendEvent::Client(ClientState::Running));
        sink.emit(BackendEvent::Client(ClientState::Running));
        wait_until(|| broadcaster.lock().client == ClientState::Running);
        broadcaster.stop();

        assert_eq!(
            *ops.lock().unwrap(),
            [
                Op::Commit("Porch".into(), NodeStatus::Online),
                Op::Reset,
                Op::Shutdown
            ]
        );
    }

    #[test]
    fn test_update_status_is_idempotent() {
        let (broadcaster, sink, ops) = start();
        sink.emit(BackendEvent::Client(ClientState::Running));
        wait_until(|| commits(&ops) == 1);

        broadcaster.update_status(NodeStatus::Streaming);
        broadcaster.update_status(NodeStatus::Streaming);
        assert_eq!(commits(&ops), 2);
        assert_eq!(
            ops.lock().unwrap()[1..],
            [Op::Reset, Op::Commit("Porch".into(), NodeStatus::Streaming)]
        );

        broadcaster.update_status(NodeStatus::Idle);
        assert_eq!(commits(&ops), 3);
    }

    #[test]
    fn test_update_before_running_is_deferred() {
        let (broadcaster, sink, ops) = start();
        broadcaster.update_status(NodeStatus::Streaming);
        broadcaster.update_status(NodeStatus::ErrorNoCamera);
        assert!(ops.lock().unwrap().is_empty());

        sink.emit(BackendEvent::Client(ClientState::Running));
        wait_until(|| commits(&ops) == 1);
        assert_eq!(
            ops.lock().unwrap()[0],
            Op::Commit("Porch".into(), NodeStatus::ErrorNoCamera)
        );
    }

    #[test]
    fn test_update_after_refused_commit_retries() {
        let refuse = Arc::new(AtomicBool::new(true));
        let (broadcaster, sink, ops) = start_refusing(refuse.clone());
        sink.emit(BackendEvent::Client(ClientState::Running));
        wait_until(|| ops.lock().unwrap().contains(&Op::CommitRefused));
        assert!(!broadcaster.lock().committed);

        refuse.store(false, Ordering::SeqCst);
        broadcaster.update_status(NodeStatus::Streaming);
        assert_eq!(
            *ops.lock().unwrap(),
            [
                Op::CommitRefused,
                Op::Reset,
                Op::Commit("Porch".into(), NodeStatus::Streaming)
            ]
        );
        assert!(broadcaster.lock().committed);
    }

    #[test]
    fn test_update_after_entry_failure_recommits() {
        let (broadcaster, sink, ops) = start();
        sink.emit(BackendEvent::Client(ClientState::Running));
        wait_until(|| commits(&ops) == 1);
        sink.emit(BackendEvent::Group(GroupEvent::Failure("send failed".into())));
        wait_until(|| !broadcaster.lock().committed);

        broadcaster.update_status(NodeStatus::Streaming);
        broadcaster.update_status(NodeStatus::Offline);
        assert_eq!(
            ops.lock().unwrap()[1..],
            [
                Op::Reset,
                Op::Commit("Porch".into(), NodeStatus::Streaming),
                Op::Reset,
                Op::Commit("Porch".into(), NodeStatus::Offline)
            ]
        );
    }

    #[test]
    fn test_stop_withdraws_entry_after_failure() {
        let (broadcaster, sink, ops) = start();
        sink.emit(BackendEvent::Client(ClientState::Running));
        wait_until(|| commits(&ops) == 1);
        sink.emit(BackendEvent::Group(GroupEvent::Failure("send failed".into())));
        wait_until(|| !broadcaster.lock().committed);

        broadcaster.stop();
        broadcaster.stop();
        assert_eq!(
            *ops.lock().unwrap(),
            [
                Op::Commit("Porch".into(), NodeStatus::Online),
                Op::Reset,
                Op::Shutdown
            ]
        );
    }

    #[test]
    fn test_collisions_rename_until_bound() {
        let (broadcaster, sink, ops) = start();
        sink.emit(BackendEvent::Client(ClientState::Running));
        for _ in 0..MAX_NAME_COLLISIONS + 3 {
            sink.emit(BackendEvent::Group(GroupEvent::Collision));
        }
        wait_until(|| broadcaster.lock().client == ClientState::Failure);
        // let any stray retries land
        std::thread::sleep(Duration::from_millis(50));

        let names: Vec<String> = ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| match op {
                Op::Commit(name, _) => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names.len(), 1 + MAX_NAME_COLLISIONS as usize);
        assert_eq!(names[0], "Porch");
        assert_eq!(names[1], "Porch #2");
        assert_eq!(names.last().map(String::as_str), Some("Porch #9"));
        assert!(!broadcaster.lock().committed);
    }

    #[test]
    fn test_established_resets_collision_count() {
        let (broadcaster, sink, ops) = start();
        sink.emit(BackendEvent::Client(ClientState::Running));
        for _ in 0..MAX_NAME_COLLISIONS {
            sink.emit(BackendEvent::Group(GroupEvent::Collision));
        }
        sink.emit(BackendEvent::Group(GroupEvent::Established));
        sink.emit(BackendEvent::Group(GroupEvent::Collision));
        wait_until(|| commits(&ops) == 2 + MAX_NAME_COLLISIONS as usize);

        assert_eq!(broadcaster.lock().client, ClientState::Running);
        assert_eq!(broadcaster.lock().collisions, 1);
        assert_eq!(broadcaster.record().name, "Porch #10");
    }
}
