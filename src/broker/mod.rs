//! Publish/subscribe transport used for stream ingestion and result
//! publication.

mod memory;
mod mqtt;

pub use memory::MemoryBroker;
pub use mqtt::{MqttBroker, MqttConnector};

use crate::error::BrokerError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

/// Default MQTT port when a stream URI omits one.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Where a stream lives: the broker URL and the topic on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub topic: String,
}

impl BrokerEndpoint {
    /// Split a stream URI such as `mqtt://localhost:1883/accX` into the
    /// broker address and the topic (the URI path without its leading `/`).
    pub fn from_stream_uri(uri: &str) -> Result<Self, BrokerError> {
        let invalid = |reason: &str| BrokerError::InvalidEndpoint {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port: url.port().unwrap_or(DEFAULT_MQTT_PORT),
            topic: url.path().trim_start_matches('/').to_string(),
        })
    }

    /// `scheme://host:port/`
    pub fn broker_url(&self) -> String {
        format!("{}://{}:{}/", self.scheme, self.host, self.port)
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe to `topic`. Messages arrive in broker delivery order.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>, BrokerError>;

    /// Publish and wait until the transport accepted the message.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Publish without waiting; fails immediately when the outbound queue is full.
    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Opens broker connections for endpoints derived from stream URIs.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn Broker>, BrokerError>;
}
