use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::analyzer::{network::config::NetworkConfig, tcpconnect::config::TcpConnectConfig};

/// Optional YAML file layered under the environment.
pub const CONFIG_FILE_ENV: &str = "NETBEE_CONFIG_FILE";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub tcp_connect: TcpConnectConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(File::new(&path, FileFormat::Yaml));
        }

        let s = builder
            .add_source(
                Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("network.protocol_parser")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }
}
