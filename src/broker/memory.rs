use super::{Broker, BrokerConnector, BrokerEndpoint, BrokerMessage};
use crate::error::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

#[derive(Default)]
struct Inner {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<BrokerMessage>>>>,
    published: Mutex<Vec<BrokerMessage>>,
    failures_remaining: AtomicUsize,
}

/// In-process broker. Every connection shares the same topics, whatever
/// endpoint it was opened for. Records everything published on it.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
    capacity: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1_024)
    }
}

impl MemoryBroker {
    /// `capacity` bounds each subscriber queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            capacity,
        }
    }

    /// Make the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: usize) {
        self.inner.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<BrokerMessage> {
        self.inner.published.lock().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<BrokerMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    fn take_failure(&self, topic: &str) -> Result<(), BrokerError> {
        let failed = self
            .inner
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BrokerError::PublishFailure {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn subscribers_of(&self, topic: &str) -> Vec<mpsc::Sender<BrokerMessage>> {
        self.inner
            .subscribers
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, message: &BrokerMessage) {
        self.inner.published.lock().push(message.clone());
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>, BrokerError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.inner
            .subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.take_failure(topic)?;
        let message = BrokerMessage {
            topic: topic.to_string(),
            payload,
        };
        self.record(&message);
        for sender in self.subscribers_of(topic) {
            let _ = sender.send(message.clone()).await;
        }
        Ok(())
    }

    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.take_failure(topic)?;
        let message = BrokerMessage {
            topic: topic.to_string(),
            payload,
        };
        let senders = self.subscribers_of(topic);
        if senders.iter().any(|s| s.capacity() == 0) {
            return Err(BrokerError::PublishFailure {
                topic: topic.to_string(),
                reason: "subscriber queue full".to_string(),
            });
        }
        self.record(&message);
        for sender in senders {
            let _ = sender.try_send(message.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, _endpoint: &BrokerEndpoint) -> Result<Arc<dyn Broker>, BrokerError> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber_in_order() {
        let broker = MemoryBroker::default();
        let mut rx = broker.subscribe("accX").await.unwrap();
        broker.publish("accX", b"1".to_vec()).await.unwrap();
        broker.publish("accX", b"2".to_vec()).await.unwrap();
        broker.publish("other", b"3".to_vec()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().payload, b"1");
        assert_eq!(rx.recv().await.unwrap().payload, b"2");
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.published().len(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let broker = MemoryBroker::default();
        broker.fail_next_publishes(1);
        assert!(broker.try_publish("out", b"a".to_vec()).is_err());
        assert!(broker.try_publish("out", b"b".to_vec()).is_ok());
        assert_eq!(broker.published_on("out").len(), 1);
    }
}
