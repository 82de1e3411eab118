use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

pub mod broker;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub const CONNECT_TOPIC: &str = "v1/gateway/connect";
pub const ATTRIBUTES_TOPIC: &str = "v1/gateway/attributes";
pub const TELEMETRY_TOPIC: &str = "v1/gateway/telemetry";

/// Publish capability the replay core drives. Implementations own connection management.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Resolves once the broker accepted the connection.
    async fn ready(&self) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: &JsonValue) -> Result<(), TransportError>;

    /// Resolves with the error that made the transport unusable. Pending forever while healthy.
    async fn failed(&self) -> TransportError;

    async fn close(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid mqtt url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("mqtt tls setup failed: {0}")]
    Tls(String),
    #[error("broker refused the connection: {0}")]
    ConnectionRefused(String),
    #[error("mqtt connection error: {0}")]
    Connection(String),
    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("transport already closed")]
    Closed,
}

/// Host/port/TLS triple extracted from an `mqtt://`, `tcp://`, `mqtts://` or `ssl://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let invalid = |reason: String| TransportError::InvalidUrl {
            url: url.to_string(),
            reason,
        };

        let parsed = Url::parse(url).map_err(|err| invalid(err.to_string()))?;
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("url must specify host".to_string()))?;

        let scheme = parsed.scheme().to_ascii_lowercase();
        let (default_port, tls) = match scheme.as_str() {
            "mqtt" | "tcp" => (1883, false),
            "mqtts" | "ssl" => (8883, true),
            other => return Err(invalid(format!("unsupported scheme `{other}`"))),
        };

        Ok(Self {
            host: host.to_string(),
            port: parsed.port().unwrap_or(default_port),
            tls,
        })
    }
}
