use crate::assets::LOCAL_DISCOVERY_SERVICE_TYPE;
use crate::discovery::backend::{BackendEvent, ClientState, DiscoveryBackend, EventSink, GroupEvent};
use crate::discovery::{DiscoveryError, ServiceRecord};
use local_ip_address::local_ip;
use log::{debug, info};
use mdns_sd::{DaemonEvent, ServiceDaemon, ServiceInfo};
use std::thread::JoinHandle;

/// mDNS responder on top of `mdns-sd`.
pub struct MdnsBackend {
    daemon: ServiceDaemon,
    registered: Option<String>,
    monitor: Option<JoinHandle<()>>,
}

impl MdnsBackend {
    pub fn start(events: EventSink) -> Result<Self, DiscoveryError> {
        events.emit(BackendEvent::Client(ClientState::Connecting));
        let daemon = ServiceDaemon::new()?;
        let receiver = daemon.monitor()?;

        let sink = events.clone();
        let monitor = std::thread::Builder::new()
            .name("mdns-monitor".into())
            .spawn(move || {
                for event in receiver.iter() {
                    match event {
                        DaemonEvent::Announce(fullname, addrs) => {
                            debug!("Discovery: announced {} at {}", fullname, addrs);
                            sink.emit(BackendEvent::Group(GroupEvent::Established));
                        }
                        DaemonEvent::NameChange(change) => {
                            debug!("Discovery: name change {:?}", change);
                            sink.emit(BackendEvent::Group(GroupEvent::Collision));
                        }
                        DaemonEvent::Error(e) => {
                            sink.emit(BackendEvent::Group(GroupEvent::Failure(e.to_string())));
                        }
                        _ => {}
                    }
                }
            })?;

        events.emit(BackendEvent::Client(ClientState::Running));
        Ok(Self {
            daemon,
            registered: None,
            monitor: Some(monitor),
        })
    }
}

impl DiscoveryBackend for MdnsBackend {
    fn commit(&mut self, record: &ServiceRecord) -> Result<(), DiscoveryError> {
        let ip = local_ip()?;
        let host_name = format!("{}.local.", record.camera_id);
        let properties = record.txt_properties();

        let service = ServiceInfo::new(
            LOCAL_DISCOVERY_SERVICE_TYPE,
            &record.name,
            &host_name,
            ip,
            record.port,
            &properties[..],
        )?
        .enable_addr_auto();
        let fullname = service.get_fullname().to_string();

        self.daemon.register(service)?;
        info!("Discovery: registered '{}' ({}) on {}", record.name, record.status, ip);
        self.registered = Some(fullname);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DiscoveryError> {
        if let Some(fullname) = self.registered.take() {
            self.daemon.unregister(&fullname)?;
            debug!("Discovery: unregistered {}", fullname);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        match self.daemon.shutdown() {
            Ok(status) => {
                let _ = status.recv();
            }
            Err(e) => debug!("Discovery: daemon shutdown: {}", e),
        }
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
    }
}
