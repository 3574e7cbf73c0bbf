use crate::assets::{MQTT_KEEP_ALIVE, MQTT_RECONNECT_MAX, MQTT_RECONNECT_MIN, MQTT_REQUEST_CAPACITY};
use crate::config::NodeConfig;
use crate::control::{Command, ControlError, StatusCallback, StatusPublisher, apply_command};
use crate::utils::sos::SignalOfStop;
use crate::utils::status::{NodeStatus, RunState};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Progress reported by the network thread while `connect` waits.
#[derive(Debug)]
enum LinkEvent {
    Connected,
    Subscribed,
    Failed(String),
}

/// Exponential reconnect delay.
#[derive(Debug)]
struct Backoff {
    next: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { next: min, min, max }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.min;
    }
}

/// MQTT session for one camera.
pub struct ControlChannel {
    client: Client,
    broker: String,
    status_topic: String,
    connected: Arc<AtomicBool>,
    stop: SignalOfStop,
    network: Mutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    /// Connects, subscribes to the command topic and starts dispatching
    /// commands. Blocks until the broker acknowledged both.
    pub fn connect(
        config: &NodeConfig,
        run_state: RunState,
        on_status: StatusCallback,
    ) -> Result<Self, ControlError> {
        let broker = config.broker.to_string();
        let mut options =
            MqttOptions::new(config.client_id(), config.broker.host.clone(), config.broker.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        options.set_clean_session(true);

        let (client, connection) = Client::new(options, MQTT_REQUEST_CAPACITY);
        let (link_tx, link_rx) = crossbeam_channel::unbounded();
        let connected = Arc::new(AtomicBool::new(false));
        let stop = SignalOfStop::new();
        let command_topic = config.command_topic();

        let network = NetworkLoop {
            connection,
            client: client.clone(),
            command_topic: command_topic.clone(),
            run_state,
            on_status,
            connected: connected.clone(),
            stop: stop.clone(),
            link_tx,
        };
        let handle = std::thread::Builder::new()
            .name("mqtt-network".into())
            .spawn(move || network.run())?;

        let channel = ControlChannel {
            client,
            broker: broker.clone(),
            status_topic: config.status_topic(),
            connected,
            stop,
            network: Mutex::new(Some(handle)),
        };

        channel.await_link(&link_rx, |e| matches!(e, LinkEvent::Connected))?;
        info!("Control: connected to {}", broker);

        channel
            .client
            .subscribe(command_topic.as_str(), QoS::AtLeastOnce)?;
        channel.await_link(&link_rx, |e| matches!(e, LinkEvent::Subscribed))?;
        info!("Control: subscribed to {}", command_topic);

        Ok(channel)
    }

    fn await_link(
        &self,
        link_rx: &Receiver<LinkEvent>,
        wanted: impl Fn(&LinkEvent) -> bool,
    ) -> Result<(), ControlError> {
        loop {
            match link_rx.recv() {
                Ok(event) if wanted(&event) => return Ok(()),
                Ok(LinkEvent::Failed(reason)) => {
                    self.join_network();
                    return Err(ControlError::Connect {
                        broker: self.broker.clone(),
                        reason,
                    });
                }
                Ok(other) => debug!("Control: ignoring {:?} while waiting", other),
                Err(_) => {
                    self.join_network();
                    return Err(ControlError::Closed);
                }
            }
        }
    }

    /// Sends DISCONNECT and waits for the network thread. Idempotent.
    pub fn disconnect(&self) {
        if self.stop.cancel() {
            if let Err(e) = self.client.try_disconnect() {
                debug!("Control: disconnect request not sent: {}", e);
            }
            self.join_network();
            self.connected.store(false, Ordering::SeqCst);
            info!("Control: disconnected from {}", self.broker);
        }
    }

    fn join_network(&self) {
        let handle = self
            .network
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            log::error!("Control: network thread panicked");
        }
    }
}

impl StatusPublisher for ControlChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish_status(&self, status: NodeStatus) -> Result<(), ControlError> {
        if self.stop.cancelled() {
            return Err(ControlError::Closed);
        }
        self.client
            .publish(self.status_topic.as_str(), QoS::AtMostOnce, false, status.as_str())?;
        debug!("Control: published {} to {}", status, self.status_topic);
        Ok(())
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Owns the rumqttc connection. Single consumer of all broker events.
struct NetworkLoop {
    connection: Connection,
    client: Client,
    command_topic: String,
    run_state: RunState,
    on_status: StatusCallback,
    connected: Arc<AtomicBool>,
    stop: SignalOfStop,
    link_tx: Sender<LinkEvent>,
}

impl NetworkLoop {
    fn run(mut self) {
        let mut backoff = Backoff::new(MQTT_RECONNECT_MIN, MQTT_RECONNECT_MAX);
        let mut established = false;

        for notification in self.connection.iter() {
            match notification {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.connected.store(true, Ordering::SeqCst);
                    if established {
                        info!("Control: reconnected to broker");
                        backoff.reset();
                        if let Err(e) = self
                            .client
                            .try_subscribe(self.command_topic.as_str(), QoS::AtLeastOnce)
                        {
                            warn!("Control: resubscribe failed: {}", e);
                        }
                    } else {
                        established = true;
                        let _ = self.link_tx.send(LinkEvent::Connected);
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    let _ = self.link_tx.send(LinkEvent::Subscribed);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic == self.command_topic {
                        dispatch(&publish.payload, &self.run_state, &self.on_status);
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    if self.stop.cancelled() {
                        break;
                    }
                    if !established {
                        let _ = self.link_tx.send(LinkEvent::Failed(e.to_string()));
                        break;
                    }
                    let delay = backoff.next_delay();
                    warn!("Control: connection lost ({}), retrying in {:?}", e, delay);
                    if self.stop.wait_timeout(delay) {
                        break;
                    }
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        debug!("Control: network loop finished");
    }
}

fn dispatch(payload: &[u8], run_state: &RunState, on_status: &StatusCallback) {
    match Command::parse(payload) {
        Some(command) => {
            info!("Control: received '{}'", command);
            let status = apply_command(command, run_state);
            on_status(status);
        }
        None => debug!(
            "Control: ignoring unknown command {:?}",
            String::from_utf8_lossy(payload)
        ),
    }
}
