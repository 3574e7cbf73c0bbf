//! Capture → encode → transmit pipeline
//!
//! One blocking loop on the calling thread. Each iteration reads a frame,
//! picks either that frame or the retained one depending on `streaming`,
//! converts and encodes it, and writes every packet the encoder emits.
//! `running` is checked at the top of each iteration only.

pub mod health;
pub mod state;
pub mod types;

use crate::assets::{HEADLESS_IDLE, STATS_LOG_INTERVAL};
use crate::capture::{CaptureError, CapturedFrame, FrameSource};
use crate::encoder::{EncoderOutput, FrameEncoder};
use crate::error::NodeError;
use crate::transport::{StreamDescriptor, StreamTransport};
use crate::utils::status::RunState;
use log::{debug, info, warn};

pub use health::{PipelineStats, StatsReporter};
pub use state::PipelineState;
pub use types::{MediaPacket, TimeBase};

/// Local display for the live camera image.
pub trait PreviewSink {
    /// Shows `frame`. Returns `false` once the operator asked to quit.
    fn show(&mut self, frame: &CapturedFrame) -> bool;
}

/// Encoder plus connected transport, ready for packets.
pub struct StreamSession<E, T> {
    // Field order is drop order: encoder before transport.
    encoder: E,
    transport: T,
    stream: StreamDescriptor,
}

impl<E: FrameEncoder, T: StreamTransport> StreamSession<E, T> {
    /// Opens the transport I/O and writes the header.
    ///
    /// On failure both halves are dropped before returning.
    pub fn open(encoder: E, mut transport: T) -> Result<Self, NodeError> {
        let stream = transport.descriptor();
        let opened = transport
            .open_io()
            .map_err(NodeError::TransportUnreachable)
            .and_then(|()| {
                transport
                    .write_header()
                    .map_err(NodeError::ProtocolNegotiation)
            });
        if let Err(e) = opened {
            drop(encoder);
            transport.close();
            return Err(e);
        }
        info!(
            "Stream: session open, stream #{} in timebase {}",
            stream.index, stream.time_base
        );
        Ok(Self {
            encoder,
            transport,
            stream,
        })
    }
}

pub struct Pipeline<S: FrameSource, E: FrameEncoder, T: StreamTransport> {
    source: S,
    device: String,
    session: StreamSession<E, T>,
    preview: Option<Box<dyn PreviewSink>>,
    run_state: RunState,
    /// Last frame captured while streaming
    retained: Option<CapturedFrame>,
    /// Presentation counter in the encoder timebase
    pts: i64,
    state: PipelineState,
    stats: PipelineStats,
    reporter: StatsReporter,
    write_failed: bool,
}

impl<S: FrameSource, E: FrameEncoder, T: StreamTransport> Pipeline<S, E, T> {
    pub fn new(
        source: S,
        device: impl Into<String>,
        session: StreamSession<E, T>,
        preview: Option<Box<dyn PreviewSink>>,
        run_state: RunState,
    ) -> Self {
        Self {
            source,
            device: device.into(),
            session,
            preview,
            run_state,
            retained: None,
            pts: 0,
            state: PipelineState::Init,
            stats: PipelineStats::default(),
            reporter: StatsReporter::new(STATS_LOG_INTERVAL),
            write_failed: false,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Runs until `running` goes false or an iteration fails.
    pub fn run(&mut self) -> Result<(), NodeError> {
        info!("Pipeline: started ({} -> stream #{})", self.device, self.session.stream.index);
        while self.run_state.is_running() {
            if let Err(e) = self.iterate() {
                self.transition(PipelineState::Error);
                return Err(e);
            }
            self.reporter.tick(&self.stats);
        }
        self.transition(PipelineState::ShuttingDown);
        Ok(())
    }

    fn iterate(&mut self) -> Result<(), NodeError> {
        let frame = self.acquire()?;
        self.stats.record_capture();

        let streaming = self.run_state.is_streaming();
        let mode = PipelineState::running(streaming);
        if !self.state.same_mode(&mode) {
            match self.state {
                PipelineState::Live { since } | PipelineState::Frozen { since } => info!(
                    "Pipeline: {}, was {} for {:.1?}",
                    mode,
                    self.state,
                    since.elapsed()
                ),
                _ => info!("Pipeline: {}", mode),
            }
            self.transition(mode);
        }

        if streaming {
            self.retained = Some(frame.clone());
        }

        match self.retained.as_ref() {
            Some(to_send) => {
                let input = self
                    .session
                    .encoder
                    .convert(to_send)
                    .map_err(NodeError::Encode)?;
                self.session
                    .encoder
                    .submit(input, self.pts)
                    .map_err(NodeError::Encode)?;
                self.pts += 1;
                self.stats.record_sent(!streaming);
                self.drain_encoder()?;
            }
            None => self.stats.record_skip(),
        }

        match self.preview.as_mut() {
            Some(preview) => {
                if !preview.show(&frame) {
                    info!("Pipeline: quit requested from preview");
                    self.run_state.shutdown();
                }
            }
            None => std::thread::sleep(HEADLESS_IDLE),
        }
        Ok(())
    }

    fn acquire(&mut self) -> Result<CapturedFrame, NodeError> {
        let result = match self.source.read() {
            Ok(frame) if frame.is_empty() => Err(CaptureError::Empty),
            other => other,
        };
        result.map_err(|source| {
            if self.stats.frames_captured == 0 {
                NodeError::DeviceUnavailable {
                    device: self.device.clone(),
                    source,
                }
            } else {
                NodeError::Capture(source)
            }
        })
    }

    /// Writes packets until the encoder has nothing more for now.
    fn drain_encoder(&mut self) -> Result<(), NodeError> {
        loop {
            match self.session.encoder.poll().map_err(NodeError::Encode)? {
                EncoderOutput::Packet(packet) => self.write(packet)?,
                EncoderOutput::WouldBlock | EncoderOutput::EndOfStream => return Ok(()),
            }
        }
    }

    fn write(&mut self, packet: MediaPacket) -> Result<(), NodeError> {
        let packet = packet
            .with_time_base(self.session.stream.time_base)
            .with_stream_index(self.session.stream.index);
        if let Err(e) = self.session.transport.write_packet(&packet) {
            self.write_failed = true;
            return Err(NodeError::Transmit(e));
        }
        self.stats.record_packet(packet.size(), packet.is_keyframe);
        Ok(())
    }

    fn transition(&mut self, next: PipelineState) {
        if !self.state.can_transition_to(&next) {
            warn!("Pipeline: unexpected transition {} -> {}", self.state, next);
        }
        debug!("Pipeline: {} -> {}", self.state, next);
        self.state = next;
    }

    /// Flushes the encoder, writes the trailer and releases the encoder,
    /// the transport and finally the device.
    pub fn shutdown(mut self) {
        if self.write_failed {
            debug!("Pipeline: skipping encoder flush after write failure");
        } else if let Err(e) = self.flush() {
            warn!("Pipeline: flush failed: {}", e);
        }
        if let Err(e) = self.session.transport.write_trailer() {
            warn!("Stream: trailer failed: {}", e);
        }
        info!("Pipeline: {}", self.stats);

        let Pipeline {
            source,
            session,
            preview,
            mut state,
            ..
        } = self;
        let StreamSession {
            encoder,
            mut transport,
            ..
        } = session;
        drop(encoder);
        transport.close();
        drop(transport);
        drop(preview);
        drop(source);

        if state.can_transition_to(&PipelineState::Stopped) {
            state = PipelineState::Stopped;
        }
        info!("Pipeline: {}", state);
    }

    fn flush(&mut self) -> Result<(), NodeError> {
        self.session.encoder.flush().map_err(NodeError::Encode)?;
        loop {
            match self.session.encoder.poll().map_err(NodeError::Encode)? {
                EncoderOutput::Packet(packet) => self.write(packet)?,
                EncoderOutput::WouldBlock | EncoderOutput::EndOfStream => return Ok(()),
            }
        }
    }
}
