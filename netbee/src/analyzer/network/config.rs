use serde::Deserialize;

use netbee_common::protocols;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 1;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 1;
const DEFAULT_FD_REUSE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_REAP_INTERVAL_SECS: u64 = 5;
const DEFAULT_RESPONSE_SLOW_THRESHOLD_MS: u64 = 500;
const DEFAULT_MAX_PAYLOAD_LENGTH: usize = 80;

/// Per-protocol tuning.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ProtocolConfig {
    pub key: String,
    /// Destination ports statically bound to this protocol.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Bytes of payload kept in `request_payload`/`response_payload` labels.
    pub payload_length: Option<usize>,
    /// Keep the parser for static ports but leave it out of the full scan.
    #[serde(default)]
    pub disable_discern: bool,
    /// Slow threshold override in milliseconds.
    pub slow_threshold: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NetworkConfig {
    pub connect_timeout: Option<u64>,
    pub request_timeout: Option<u64>,
    pub fd_reuse_timeout: Option<u64>,
    pub reap_interval: Option<u64>,
    pub response_slow_threshold: Option<u64>,
    pub max_payload_length: Option<usize>,
    #[serde(default)]
    pub enable_conntrack: bool,
    #[serde(default = "default_protocol_parser")]
    pub protocol_parser: Vec<String>,
    #[serde(default = "default_protocol_config")]
    pub protocol_config: Vec<ProtocolConfig>,
}

fn default_protocol_parser() -> Vec<String> {
    [
        protocols::HTTP,
        protocols::MYSQL,
        protocols::DNS,
        protocols::REDIS,
        protocols::KAFKA,
        protocols::DUBBO,
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

fn default_protocol_config() -> Vec<ProtocolConfig> {
    let with_port = |key: &str, port: u16| ProtocolConfig {
        key: key.to_string(),
        ports: vec![port],
        slow_threshold: Some(100),
        ..Default::default()
    };
    vec![
        ProtocolConfig {
            key: protocols::HTTP.to_string(),
            payload_length: Some(200),
            ..Default::default()
        },
        ProtocolConfig {
            key: protocols::DUBBO.to_string(),
            payload_length: Some(200),
            ..Default::default()
        },
        with_port(protocols::MYSQL, 3306),
        with_port(protocols::KAFKA, 9092),
        with_port(protocols::DNS, 53),
    ]
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            request_timeout: None,
            fd_reuse_timeout: None,
            reap_interval: None,
            response_slow_threshold: None,
            max_payload_length: None,
            enable_conntrack: false,
            protocol_parser: default_protocol_parser(),
            protocol_config: default_protocol_config(),
        }
    }
}

fn positive_or<T: PartialOrd + Default + Copy>(value: Option<T>, default: T) -> T {
    match value {
        Some(v) if v > T::default() => v,
        _ => default,
    }
}

impl NetworkConfig {
    pub fn connect_timeout_secs(&self) -> u64 {
        positive_or(self.connect_timeout, DEFAULT_CONNECT_TIMEOUT_SECS)
    }

    pub fn request_timeout_secs(&self) -> u64 {
        positive_or(self.request_timeout, DEFAULT_REQUEST_TIMEOUT_SECS)
    }

    pub fn fd_reuse_timeout_secs(&self) -> u64 {
        positive_or(self.fd_reuse_timeout, DEFAULT_FD_REUSE_TIMEOUT_SECS)
    }

    pub fn reap_interval_secs(&self) -> u64 {
        positive_or(self.reap_interval, DEFAULT_REAP_INTERVAL_SECS)
    }

    pub fn response_slow_threshold_ms(&self) -> u64 {
        positive_or(self.response_slow_threshold, DEFAULT_RESPONSE_SLOW_THRESHOLD_MS)
    }

    pub fn max_payload_length(&self) -> usize {
        positive_or(self.max_payload_length, DEFAULT_MAX_PAYLOAD_LENGTH)
    }
}
