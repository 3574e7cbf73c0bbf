use crate::assets::{
    CLIENT_ID_PREFIX, FRAME_RATE, MQTT_DEFAULT_PORT, RTSP_RELAY_PORT, TOPIC_NAMESPACE,
};
use clap::builder::BoolishValueParser;
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed camera device '{0}' (expected /dev/videoN or N)")]
    InvalidDevice(String),
    #[error("malformed broker address '{0}' (expected [tcp://]host[:port])")]
    InvalidBroker(String),
    #[error("invalid camera id '{0}' (must be non-empty and free of '/', '+', '#')")]
    InvalidCameraId(String),
}

/// V4L2 device selector, given either as `/dev/videoN` or as the bare index `N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelector {
    index: u32,
}

impl DeviceSelector {
    const DEVICE_PREFIX: &'static str = "/dev/video";

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> String {
        format!("{}{}", Self::DEVICE_PREFIX, self.index)
    }
}

impl FromStr for DeviceSelector {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().strip_prefix(Self::DEVICE_PREFIX).unwrap_or(s.trim());
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::InvalidDevice(s.to_string()));
        }
        digits
            .parse::<u32>()
            .map(|index| DeviceSelector { index })
            .map_err(|_| ConfigError::InvalidDevice(s.to_string()))
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidBroker(s.to_string());
        let trimmed = s.trim();
        let rest = match trimmed.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some(_) => return Err(invalid()),
            None => trimmed,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (rest, MQTT_DEFAULT_PORT),
        };
        if host.is_empty() || host.contains('/') || port == 0 {
            return Err(invalid());
        }
        Ok(BrokerAddress {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// Node identity and runtime options, resolved once at start-up.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub camera_id: String,
    pub camera_name: String,
    pub broker: BrokerAddress,
    pub device: DeviceSelector,
    pub fps: u32,
    pub rtsp_host: String,
    pub rtsp_port: u16,
    pub preview: bool,
}

impl NodeConfig {
    pub fn command() -> Command {
        Command::new(app_name())
            .version(app_version())
            .about(env!("CARGO_PKG_DESCRIPTION"))
            .arg(
                Arg::new("camera-id")
                    .long("camera-id")
                    .env("CAMERA_ID")
                    .value_name("ID")
                    .help("Camera identity, used in topics, the relay path and discovery.")
                    .default_value("camera1"),
            )
            .arg(
                Arg::new("camera-name")
                    .long("camera-name")
                    .env("CAMERA_NAME")
                    .value_name("NAME")
                    .help("Friendly name advertised over mDNS.")
                    .default_value("OpenSentry Camera 1"),
            )
            .arg(
                Arg::new("mqtt-server")
                    .long("mqtt-server")
                    .env("MQTT_SERVER")
                    .value_name("URL")
                    .help("MQTT broker address.")
                    .default_value("tcp://localhost:1883"),
            )
            .arg(
                Arg::new("camera-device")
                    .long("camera-device")
                    .env("CAMERA_DEVICE")
                    .value_name("DEVICE")
                    .help("Capture device, /dev/videoN or N.")
                    .default_value("/dev/video0"),
            )
            .arg(
                Arg::new("fps")
                    .long("fps")
                    .env("CAMERA_FPS")
                    .value_name("FPS")
                    .help("Capture and encode frame rate.")
                    .value_parser(value_parser!(u32).range(1..=120))
                    .default_value("30"),
            )
            .arg(
                Arg::new("rtsp-host")
                    .long("rtsp-host")
                    .env("RTSP_HOST")
                    .value_name("HOST")
                    .help("RTSP relay host.")
                    .default_value("localhost"),
            )
            .arg(
                Arg::new("rtsp-port")
                    .long("rtsp-port")
                    .env("RTSP_PORT")
                    .value_name("PORT")
                    .help("RTSP relay port.")
                    .value_parser(value_parser!(u16).range(1..))
                    .default_value("8554"),
            )
            .arg(headless_arg())
    }

    /// Builds the configuration. `display_available` tells whether a local
    /// display (the `DISPLAY` variable) exists for the preview window.
    pub fn from_matches(
        matches: &ArgMatches,
        display_available: bool,
    ) -> Result<NodeConfig, ConfigError> {
        let text = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .unwrap_or_default()
        };

        let camera_id = text("camera-id");
        if camera_id.is_empty() || camera_id.contains(['/', '+', '#']) {
            return Err(ConfigError::InvalidCameraId(camera_id));
        }
        let device = text("camera-device").parse::<DeviceSelector>()?;
        let broker = text("mqtt-server").parse::<BrokerAddress>()?;

        Ok(NodeConfig {
            camera_name: text("camera-name"),
            broker,
            device,
            fps: matches.get_one::<u32>("fps").copied().unwrap_or(FRAME_RATE),
            rtsp_host: text("rtsp-host"),
            rtsp_port: matches
                .get_one::<u16>("rtsp-port")
                .copied()
                .unwrap_or(RTSP_RELAY_PORT),
            preview: display_available && !matches.get_flag("headless"),
            camera_id,
        })
    }

    pub fn client_id(&self) -> String {
        format!("{}{}", CLIENT_ID_PREFIX, self.camera_id)
    }

    pub fn command_topic(&self) -> String {
        format!("{}/{}/command", TOPIC_NAMESPACE, self.camera_id)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/{}/status", TOPIC_NAMESPACE, self.camera_id)
    }

    /// Path of this camera's stream on the relay.
    pub fn rtsp_path(&self) -> &str {
        &self.camera_id
    }

    pub fn relay_url(&self) -> String {
        format!(
            "rtsp://{}:{}/{}",
            self.rtsp_host,
            self.rtsp_port,
            self.rtsp_path()
        )
    }
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

/// `OPENSENTRY_HEADLESS` takes the usual spellings (`1`, `yes`, `on`, `true`).
fn headless_arg() -> Arg {
    Arg::new("headless")
        .long("headless")
        .env("OPENSENTRY_HEADLESS")
        .help("Never open a local preview window.")
        .action(ArgAction::SetTrue)
        .value_parser(BoolishValueParser::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<NodeConfig, ConfigError> {
        let mut argv = vec!["opensentry-node"];
        argv.extend_from_slice(args);
        let matches = NodeConfig::command().try_get_matches_from(argv).unwrap();
        NodeConfig::from_matches(&matches, false)
    }

    #[test]
    fn test_device_selector_forms() {
        assert_eq!("/dev/video0".parse::<DeviceSelector>().unwrap().index(), 0);
        assert_eq!("/dev/video12".parse::<DeviceSelector>().unwrap().index(), 12);
        assert_eq!("3".parse::<DeviceSelector>().unwrap().path(), "/dev/video3");
    }

    #[test]
    fn test_device_selector_malformed() {
        for bad in ["", "/dev/video", "/dev/videoX", "video0", "-1", "/dev/sda", "1.5"] {
            assert_eq!(
                bad.parse::<DeviceSelector>(),
                Err(ConfigError::InvalidDevice(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_broker_address() {
        let addr = "tcp://localhost:1883".parse::<BrokerAddress>().unwrap();
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.port, 1883);

        let addr = "mqtt://10.0.0.5".parse::<BrokerAddress>().unwrap();
        assert_eq!(addr.port, MQTT_DEFAULT_PORT);

        let addr = "broker.lan:2883".parse::<BrokerAddress>().unwrap();
        assert_eq!(addr.to_string(), "tcp://broker.lan:2883");

        assert!("ws://host:80".parse::<BrokerAddress>().is_err());
        assert!("tcp://:1883".parse::<BrokerAddress>().is_err());
        assert!("tcp://host:notaport".parse::<BrokerAddress>().is_err());
    }

    #[test]
    fn test_topics_and_relay_url() {
        let config = parse(&["--camera-id", "porch", "--rtsp-host", "relay.lan"]).unwrap();
        assert_eq!(config.command_topic(), "opensentry/porch/command");
        assert_eq!(config.status_topic(), "opensentry/porch/status");
        assert_eq!(config.client_id(), "opensentry_node_porch");
        assert_eq!(config.relay_url(), "rtsp://relay.lan:8554/porch");
        assert!(!config.preview);
    }

    #[test]
    fn test_malformed_device_is_config_error() {
        let err = parse(&["--camera-device", "/dev/videoABC"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDevice(_)));
    }

    #[test]
    fn test_camera_id_rejects_topic_wildcards() {
        assert!(matches!(
            parse(&["--camera-id", "a/b"]),
            Err(ConfigError::InvalidCameraId(_))
        ));
        assert!(matches!(
            parse(&["--camera-id", "cam#"]),
            Err(ConfigError::InvalidCameraId(_))
        ));
    }

    #[test]
    fn test_preview_needs_display_and_not_headless() {
        let matches = NodeConfig::command()
            .try_get_matches_from(["opensentry-node"])
            .unwrap();
        assert!(NodeConfig::from_matches(&matches, true).unwrap().preview);

        let matches = NodeConfig::command()
            .try_get_matches_from(["opensentry-node", "--headless"])
            .unwrap();
        assert!(!NodeConfig::from_matches(&matches, true).unwrap().preview);
    }

    #[test]
    fn test_headless_from_environment() {
        // a variable of its own so parallel tests never see it
        const VAR: &str = "OPENSENTRY_NODE_TEST_HEADLESS";
        let command = || Command::new("opensentry-node").arg(headless_arg().env(VAR));

        for (value, headless) in [("1", true), ("yes", true), ("on", true), ("0", false), ("no", false)] {
            unsafe { std::env::set_var(VAR, value) };
            let matches = command().try_get_matches_from(["opensentry-node"]);
            assert_eq!(
                matches.map(|m| m.get_flag("headless")).ok(),
                Some(headless),
                "{VAR}={value}"
            );
        }
        unsafe { std::env::remove_var(VAR) };
    }
}
