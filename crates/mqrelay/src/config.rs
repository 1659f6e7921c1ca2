//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Environment variable holding the broker endpoint as `host:port`.
pub const BROKER_ENV: &str = "MQRELAY_BROKER";

/// Environment variable overriding the MQTT packet size limit, in bytes.
pub const MAX_PACKET_SIZE_ENV: &str = "MQRELAY_MAX_PACKET_SIZE";

/// 16 MiB: frames are base64, so this carries files up to about 12 MiB.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid broker endpoint '{0}': expected host:port")]
    InvalidEndpoint(String),
    #[error("invalid port in '{0}'")]
    InvalidPort(String),
    #[error("invalid packet size '{0}': expected a positive number of bytes")]
    InvalidPacketSize(String),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// MQTT client id. A random one is generated when unset.
    pub client_id: Option<String>,
    pub keep_alive: Duration,
    /// Capacity of the request channel between client handle and event loop.
    pub capacity: usize,
    pub connect_timeout: Duration,
    /// Largest MQTT packet sent or accepted, in bytes.
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_BROKER_PORT,
            client_id: None,
            keep_alive: Duration::from_secs(60),
            capacity: 64,
            connect_timeout: Duration::from_secs(10),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl BrokerConfig {
    /// Defaults, overridden by `MQRELAY_BROKER` and `MQRELAY_MAX_PACKET_SIZE`
    /// when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(endpoint) = std::env::var(BROKER_ENV) {
            config = config.with_endpoint(&endpoint)?;
        }
        if let Ok(size) = std::env::var(MAX_PACKET_SIZE_ENV) {
            config.max_packet_size = parse_packet_size(&size)?;
        }
        Ok(config)
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self, ConfigError> {
        let (host, port) = parse_endpoint(endpoint)?;
        self.host = host;
        self.port = port;
        Ok(self)
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_id(&self) -> String {
        match &self.client_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => format!("mqrelay-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

/// Parse `host:port`. A bare host gets the default MQTT port.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), ConfigError> {
    let endpoint = endpoint.trim();
    let (host, port) = match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(endpoint.to_string()))?;
            (host, port)
        }
        None => (endpoint, DEFAULT_BROKER_PORT),
    };
    if host.is_empty() {
        return Err(ConfigError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok((host.to_string(), port))
}

pub fn parse_packet_size(value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(ConfigError::InvalidPacketSize(value.to_string())),
    }
}

/// Worker-side settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Prepended to the request name to form the reply name.
    pub prefix: String,
    /// When set, every transformed file is also written here.
    pub output_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            prefix: "CAPS_".to_string(),
            output_dir: None,
        }
    }
}
