//! Version information for mqrelay.

/// mqrelay version from Cargo.toml
pub const MQRELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the gateway.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub mqrelay: &'static str,
    /// Broker endpoint the process is attached to (if known).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            mqrelay: MQRELAY_VERSION,
            broker: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(mut self, endpoint: impl Into<String>) -> Self {
        self.broker = Some(endpoint.into());
        self
    }
}
