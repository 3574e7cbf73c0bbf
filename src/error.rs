use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::encoder::EncodeError;
use crate::transport::TransportError;
use crate::utils::status::NodeStatus;
use thiserror::Error;

/// Process-level failures. Everything here is fatal for the node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("camera {device} unavailable: {source}")]
    DeviceUnavailable {
        device: String,
        #[source]
        source: CaptureError,
    },

    #[error("no usable H.264 encoder: {0}")]
    EncoderUnavailable(#[source] EncodeError),

    #[error("could not set up output stream: {0}")]
    StreamSetup(#[source] TransportError),

    #[error("RTSP relay unreachable: {0}")]
    TransportUnreachable(#[source] TransportError),

    #[error("RTSP negotiation failed: {0}")]
    ProtocolNegotiation(#[source] TransportError),

    #[error("capture failed mid-stream: {0}")]
    Capture(#[source] CaptureError),

    #[error("encoding failed: {0}")]
    Encode(#[source] EncodeError),

    #[error("transmission failed: {0}")]
    Transmit(#[source] TransportError),
}

impl NodeError {
    /// Terminal status to publish for this failure, if it has one.
    pub fn status(&self) -> Option<NodeStatus> {
        match self {
            NodeError::DeviceUnavailable { .. } => Some(NodeStatus::ErrorNoCamera),
            NodeError::TransportUnreachable(_) => Some(NodeStatus::ErrorNoRtspServer),
            NodeError::EncoderUnavailable(_)
            | NodeError::StreamSetup(_)
            | NodeError::ProtocolNegotiation(_) => Some(NodeStatus::ErrorStreamInit),
            NodeError::Config(_)
            | NodeError::Capture(_)
            | NodeError::Encode(_)
            | NodeError::Transmit(_) => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            NodeError::Config(_) => 2,
            NodeError::DeviceUnavailable { .. } => 3,
            NodeError::TransportUnreachable(_) => 4,
            NodeError::EncoderUnavailable(_)
            | NodeError::StreamSetup(_)
            | NodeError::ProtocolNegotiation(_) => 5,
            NodeError::Capture(_) | NodeError::Encode(_) | NodeError::Transmit(_) => 6,
        }
    }

    /// Operator hints for the two common setup mistakes.
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            NodeError::DeviceUnavailable { .. } => Some(
                "Check that the camera is plugged in and listed by `ls /dev/video*`, \
                 and that this user can open it (`sudo usermod -aG video $USER`, then log in again).",
            ),
            NodeError::TransportUnreachable(_) => Some(
                "Check that the RTSP relay (for example MediaMTX) is running \
                 and listening on the configured host and port (default 8554).",
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_error() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")
    }

    #[test]
    fn test_status_mapping() {
        let no_camera = NodeError::DeviceUnavailable {
            device: "/dev/video0".into(),
            source: CaptureError::Empty,
        };
        assert_eq!(no_camera.status(), Some(NodeStatus::ErrorNoCamera));
        assert!(no_camera.guidance().is_some());

        let unreachable = NodeError::TransportUnreachable(TransportError::Io(io_error()));
        assert_eq!(unreachable.status(), Some(NodeStatus::ErrorNoRtspServer));
        assert!(unreachable.guidance().is_some());

        let negotiation = NodeError::ProtocolNegotiation(TransportError::Io(io_error()));
        assert_eq!(negotiation.status(), Some(NodeStatus::ErrorStreamInit));
        assert!(negotiation.guidance().is_none());

        let halt = NodeError::Capture(CaptureError::Empty);
        assert_eq!(halt.status(), None);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            NodeError::Config(ConfigError::InvalidDevice("x".into())).exit_code(),
            NodeError::DeviceUnavailable {
                device: "/dev/video0".into(),
                source: CaptureError::Empty,
            }
            .exit_code(),
            NodeError::TransportUnreachable(TransportError::Io(io_error())).exit_code(),
            NodeError::StreamSetup(TransportError::InvalidUrl("x".into())).exit_code(),
            NodeError::Transmit(TransportError::Io(io_error())).exit_code(),
        ];
        assert_eq!(codes, [2, 3, 4, 5, 6]);
        assert!(codes.iter().all(|code| *code != 0));
    }
}
