//! Start-up and teardown of a camera node
//!
//! Discovery and the control channel are best effort and only degrade the
//! node when they fail. The device and the streaming session are required:
//! a failure there unwinds what was acquired, announces a terminal status
//! and ends the run with a distinguishing error.

use crate::assets::HEARTBEAT_INTERVAL;
use crate::capture::{FrameSource, V4lCamera};
use crate::config::NodeConfig;
use crate::control::{ControlChannel, Heartbeat, StatusCallback, StatusPublisher};
use crate::discovery::{Broadcaster, ServiceRecord};
use crate::encoder::{EncoderParams, FfmpegEncoder, FrameEncoder};
use crate::error::NodeError;
use crate::pipeline::{Pipeline, PreviewSink, StreamSession};
use crate::transport::{RtspPublisher, StreamTransport};
use crate::utils::status::{NodeStatus, RunState};
use log::{error, info, warn};
use std::sync::Arc;

/// Opens the media collaborators of one run.
pub trait MediaBackend {
    type Source: FrameSource;
    type Encoder: FrameEncoder;
    type Transport: StreamTransport;

    fn open_device(&mut self, config: &NodeConfig) -> Result<Self::Source, NodeError>;

    /// Allocates the output context. Nothing is connected yet.
    fn create_transport(&mut self, url: &str) -> Result<Self::Transport, NodeError>;

    fn open_encoder(&mut self, params: EncoderParams) -> Result<Self::Encoder, NodeError>;

    fn open_preview(
        &mut self,
        config: &NodeConfig,
        resolution: (u32, u32),
    ) -> Option<Box<dyn PreviewSink>>;
}

/// Status reporting and the non-media services around the pipeline.
pub trait NodeServices {
    /// Publishes `status` on the control channel and advertises it over
    /// discovery, on whichever of the two is available.
    fn announce(&self, status: NodeStatus);

    /// Joins the heartbeat and disconnects from the broker.
    fn wind_down(&mut self);

    fn stop_discovery(&mut self);
}

/// V4L2 capture, FFmpeg encoding and RTSP publishing.
pub struct FfmpegMedia;

impl MediaBackend for FfmpegMedia {
    type Source = V4lCamera;
    type Encoder = FfmpegEncoder;
    type Transport = RtspPublisher;

    fn open_device(&mut self, config: &NodeConfig) -> Result<V4lCamera, NodeError> {
        V4lCamera::open(&config.device, config.fps).map_err(|source| {
            NodeError::DeviceUnavailable {
                device: config.device.path(),
                source,
            }
        })
    }

    fn create_transport(&mut self, url: &str) -> Result<RtspPublisher, NodeError> {
        RtspPublisher::new(url).map_err(NodeError::StreamSetup)
    }

    fn open_encoder(&mut self, params: EncoderParams) -> Result<FfmpegEncoder, NodeError> {
        FfmpegEncoder::open(params).map_err(NodeError::EncoderUnavailable)
    }

    #[cfg(feature = "preview")]
    fn open_preview(
        &mut self,
        config: &NodeConfig,
        (width, height): (u32, u32),
    ) -> Option<Box<dyn PreviewSink>> {
        if !config.preview {
            return None;
        }
        match crate::preview::WindowPreview::open(&config.camera_name, width, height) {
            Ok(preview) => Some(Box::new(preview)),
            Err(e) => {
                warn!("Pipeline: no preview window, running headless: {}", e);
                None
            }
        }
    }

    #[cfg(not(feature = "preview"))]
    fn open_preview(
        &mut self,
        config: &NodeConfig,
        _resolution: (u32, u32),
    ) -> Option<Box<dyn PreviewSink>> {
        if config.preview {
            info!("Pipeline: built without preview support, running headless");
        }
        None
    }
}

/// MQTT control, heartbeat and mDNS, each present only if it started.
pub struct LiveServices {
    control: Option<Arc<ControlChannel>>,
    heartbeat: Option<Heartbeat>,
    discovery: Option<Arc<Broadcaster>>,
}

impl LiveServices {
    /// Starts discovery, then the control channel and its heartbeat.
    pub fn start(config: &NodeConfig, run_state: &RunState) -> Self {
        let record = ServiceRecord::from_config(config, NodeStatus::Online);
        let discovery = match Broadcaster::start_mdns(record) {
            Ok(broadcaster) => Some(Arc::new(broadcaster)),
            Err(e) => {
                warn!("Discovery: unavailable, streaming without it: {}", e);
                None
            }
        };
        Self::with_discovery(config, run_state, discovery)
    }

    fn with_discovery(
        config: &NodeConfig,
        run_state: &RunState,
        discovery: Option<Arc<Broadcaster>>,
    ) -> Self {
        let listener = discovery.clone();
        let on_status: StatusCallback = Box::new(move |status| {
            if let Some(discovery) = &listener {
                discovery.update_status(status);
            }
        });

        let control = match ControlChannel::connect(config, run_state.clone(), on_status) {
            Ok(channel) => Some(Arc::new(channel)),
            Err(e) => {
                warn!("Control: {}, running without remote control", e);
                None
            }
        };

        let mut services = Self {
            control,
            heartbeat: None,
            discovery,
        };

        match services.control.clone() {
            Some(control) => {
                services.announce(NodeStatus::Online);
                match Heartbeat::start(control, run_state.clone(), HEARTBEAT_INTERVAL) {
                    Ok(heartbeat) => services.heartbeat = Some(heartbeat),
                    Err(e) => warn!("Control: heartbeat not started: {}", e),
                }
            }
            None => {
                if let Some(discovery) = &services.discovery {
                    discovery.update_status(NodeStatus::Streaming);
                }
            }
        }
        services
    }
}

impl NodeServices for LiveServices {
    fn announce(&self, status: NodeStatus) {
        if let Some(control) = &self.control
            && let Err(e) = control.publish_status(status)
        {
            warn!("Control: could not publish {}: {}", status, e);
        }
        if let Some(discovery) = &self.discovery {
            discovery.update_status(status);
        }
    }

    fn wind_down(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.join();
        }
        if let Some(control) = self.control.take() {
            control.disconnect();
        }
    }

    fn stop_discovery(&mut self) {
        if let Some(discovery) = self.discovery.take() {
            discovery.stop();
        }
    }
}

pub struct Node<M, N> {
    config: NodeConfig,
    media: M,
    services: N,
    run_state: RunState,
}

impl<M: MediaBackend, N: NodeServices> Node<M, N> {
    pub fn new(config: NodeConfig, media: M, services: N, run_state: RunState) -> Self {
        Self {
            config,
            media,
            services,
            run_state,
        }
    }

    /// Opens the device and the session, streams until `running` goes false,
    /// then tears everything down in reverse order.
    pub fn stream(mut self) -> Result<(), NodeError> {
        let source = match self.media.open_device(&self.config) {
            Ok(source) => source,
            Err(e) => return Err(self.abort(e)),
        };
        let (width, height) = source.resolution();
        let params = EncoderParams {
            width,
            height,
            fps: self.config.fps,
        };

        let session = match self.open_session(params) {
            Ok(session) => session,
            Err(e) => {
                drop(source);
                return Err(self.abort(e));
            }
        };
        let preview = self.media.open_preview(&self.config, (width, height));

        self.services.announce(NodeStatus::Streaming);
        let mut pipeline = Pipeline::new(
            source,
            self.config.device.path(),
            session,
            preview,
            self.run_state.clone(),
        );
        let outcome = pipeline.run();

        self.run_state.shutdown();
        let terminal = match &outcome {
            Ok(()) => NodeStatus::Offline,
            Err(e) => {
                error!("Pipeline: halted: {}", e);
                e.status().unwrap_or(NodeStatus::Offline)
            }
        };
        self.services.announce(terminal);
        self.services.wind_down();
        pipeline.shutdown();
        self.services.stop_discovery();
        info!("Node: stopped");
        outcome
    }

    fn open_session(
        &mut self,
        params: EncoderParams,
    ) -> Result<StreamSession<M::Encoder, M::Transport>, NodeError> {
        let transport = self.media.create_transport(&self.config.relay_url())?;
        let encoder = self.media.open_encoder(params)?;
        StreamSession::open(encoder, transport)
    }

    /// Start-up failed after discovery and control were set up.
    fn abort(&mut self, err: NodeError) -> NodeError {
        error!("Node: start-up failed: {}", err);
        self.run_state.shutdown();
        if let Some(status) = err.status() {
            self.services.announce(status);
        }
        self.services.wind_down();
        self.services.stop_discovery();
        err
    }
}

/// Runs a node on the real collaborators.
pub fn run(config: NodeConfig, run_state: RunState) -> Result<(), NodeError> {
    let services = LiveServices::start(&config, &run_state);
    Node::new(config, FfmpegMedia, services, run_state).stream()
}
