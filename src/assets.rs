use std::time::Duration;

pub const FRAME_RATE: u32 = 30;

// control channel
pub const TOPIC_NAMESPACE: &str = "opensentry";
pub const CLIENT_ID_PREFIX: &str = "opensentry_node_";
pub const MQTT_DEFAULT_PORT: u16 = 1883;
pub const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(20);
pub const MQTT_RECONNECT_MIN: Duration = Duration::from_secs(1);
pub const MQTT_RECONNECT_MAX: Duration = Duration::from_secs(30);
pub const MQTT_REQUEST_CAPACITY: usize = 16;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

// discovery
pub const LOCAL_DISCOVERY_SERVICE_TYPE: &str = "_opensentry._tcp.local.";
pub const DISCOVERY_TYPE_MARKER: &str = "camera";
pub const DISCOVERY_PROTOCOL_MARKER: &str = "rtsp";
pub const MAX_NAME_COLLISIONS: u32 = 8;
pub const COLLISION_BACKOFF_STEP: Duration = Duration::from_millis(250);

// relay
pub const RTSP_DEFAULT_PORT: u16 = 554;
pub const RTSP_RELAY_PORT: u16 = 8554;
pub const RTSP_USER_AGENT: &str = concat!("opensentry-node/", env!("CARGO_PKG_VERSION"));
pub const RTP_PAYLOAD_TYPE: u8 = 96;
pub const RTP_CLOCK_RATE: i32 = 90_000;
pub const RTP_MAX_PAYLOAD: usize = 1400;

// pipeline
pub const HEADLESS_IDLE: Duration = Duration::from_millis(1);
pub const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);
pub const CAPTURE_BUFFERS: u32 = 4;
