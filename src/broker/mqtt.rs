//! MQTT transport using rumqttc.

use super::{Broker, BrokerConnector, BrokerEndpoint, BrokerMessage};
use crate::error::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectionError, Event as MqttEvent, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Subscribers = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<BrokerMessage>>>>>;

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Connection settings shared by every MQTT client the connector opens.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    pub qos: u8,
    pub keep_alive: Duration,
    pub request_capacity: usize,
    pub subscriber_capacity: usize,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            qos: 0,
            keep_alive: Duration::from_secs(60),
            request_capacity: 10_000,
            subscriber_capacity: 1_024,
        }
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn Broker>, BrokerError> {
        Ok(Arc::new(MqttBroker::connect(endpoint, self)?))
    }
}

/// One MQTT client plus the task driving its event loop. Dropping the broker
/// stops the event loop.
pub struct MqttBroker {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
    endpoint: BrokerEndpoint,
    qos: QoS,
    subscriber_capacity: usize,
    subscribers: Subscribers,
}

impl MqttBroker {
    pub fn connect(endpoint: &BrokerEndpoint, settings: &MqttConnector) -> Result<Self, BrokerError> {
        // Every stream gets its own connection, so ids must not collide
        let client_id = format!(
            "rsp-approx-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        );
        let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(settings.keep_alive);

        let (client, mut eventloop) = AsyncClient::new(options, settings.request_capacity);
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));

        let dispatch = subscribers.clone();
        let broker_url = endpoint.broker_url();
        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        let senders = dispatch
                            .lock()
                            .get(publish.topic.as_str())
                            .cloned()
                            .unwrap_or_default();
                        for sender in senders {
                            let message = BrokerMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            };
                            // Awaiting keeps delivery order per topic
                            if sender.send(message).await.is_err() {
                                debug!(topic = %publish.topic, "subscriber dropped");
                            }
                        }
                    }
                    Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                        info!(broker = %broker_url, "connected to MQTT broker");
                    }
                    Ok(_) => {}
                    Err(ConnectionError::RequestsDone) => {
                        debug!(broker = %broker_url, "MQTT client closed, stopping event loop");
                        break;
                    }
                    Err(e) => {
                        warn!(broker = %broker_url, error = %e, "MQTT event loop error, retrying in 1s");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            event_loop,
            endpoint: endpoint.clone(),
            qos: qos_from_u8(settings.qos),
            subscriber_capacity: settings.subscriber_capacity,
            subscribers,
        })
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>, BrokerError> {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        self.subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        self.client
            .subscribe(topic, self.qos)
            .await
            .map_err(|e| BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        info!(broker = %self.endpoint.broker_url(), topic, "subscribed");
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(topic, self.qos, false, payload)
            .await
            .map_err(|e| BrokerError::PublishFailure {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .try_publish(topic, self.qos, false, payload)
            .map_err(|e| BrokerError::PublishFailure {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}
