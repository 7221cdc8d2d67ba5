//! Turns result ticks into aggregation events and republishes them.

use crate::broker::Broker;
use crate::engine::ResultTick;
use crate::error::PublishError;
use crate::event_log::EventLog;
use oxigraph::model::vocab::xsd;
use oxigraph::model::{Literal, NamedNode, Triple};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const AGGREGATION_EVENT_BASE: &str = "https://rsp.js/aggregation_event/";
pub const SAREF_HAS_VALUE: &str = "https://saref.etsi.org/core/hasValue";
pub const SAREF_IS_MEASURED_IN: &str = "https://saref.etsi.org/core/isMeasuredIn";

/// One numeric binding of a result tick.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedValue {
    pub variable: String,
    pub value: f64,
    /// The value as the engine rendered it.
    pub lexical: String,
}

/// The validated bindings of one result tick, in solution order.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    pub query: String,
    pub values: Vec<AggregatedValue>,
}

impl AggregationResult {
    pub fn from_tick(tick: &ResultTick) -> Result<Self, PublishError> {
        if tick.bindings.is_empty() {
            return Err(PublishError::EmptyResult(tick.query.clone()));
        }
        let values = tick
            .bindings
            .iter()
            .map(|b| {
                let lexical = b.value.trim();
                match lexical.parse::<f64>() {
                    Ok(value) if value.is_finite() => Ok(AggregatedValue {
                        variable: b.variable.clone(),
                        value,
                        lexical: lexical.to_string(),
                    }),
                    _ => Err(PublishError::NonNumeric {
                        variable: b.variable.clone(),
                        value: b.value.clone(),
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            query: tick.query.clone(),
            values,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationEvent {
    pub id: String,
    pub value: f64,
    pub unit: Option<String>,
}

impl AggregationEvent {
    /// A new event with a fresh identifier.
    pub fn new(value: f64, unit: Option<String>) -> Self {
        Self {
            id: format!("{AGGREGATION_EVENT_BASE}{}", uuid::Uuid::new_v4()),
            value,
            unit,
        }
    }

    /// N-Triples serialization: the float value and, if set, the unit.
    pub fn to_ntriples(&self) -> Result<String, PublishError> {
        let subject =
            NamedNode::new(self.id.as_str()).map_err(|e| PublishError::Statement(e.to_string()))?;
        let value = Triple::new(
            subject.clone(),
            NamedNode::new_unchecked(SAREF_HAS_VALUE),
            Literal::new_typed_literal(self.value.to_string(), xsd::FLOAT),
        );
        let mut out = format!("{value} .\n");
        if let Some(unit) = &self.unit {
            let unit =
                NamedNode::new(unit.as_str()).map_err(|e| PublishError::Statement(e.to_string()))?;
            let measured_in = Triple::new(
                subject,
                NamedNode::new_unchecked(SAREF_IS_MEASURED_IN),
                unit,
            );
            out.push_str(&format!("{measured_in} .\n"));
        }
        Ok(out)
    }
}

/// What to do when the broker's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPolicy {
    /// Hand the event over without waiting; a full queue drops it.
    #[default]
    DropWhenFull,
    /// Wait until the transport accepts the event.
    Wait,
}

#[derive(Debug, Default)]
pub struct PublishStats {
    published: AtomicU64,
    failed: AtomicU64,
    malformed_ticks: AtomicU64,
}

impl PublishStats {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn malformed_ticks(&self) -> u64 {
        self.malformed_ticks.load(Ordering::Relaxed)
    }
}

pub struct Publisher {
    broker: Arc<dyn Broker>,
    topic: String,
    policy: PublishPolicy,
    unit: Option<String>,
    event_log: Option<EventLog>,
    stats: Arc<PublishStats>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
            policy: PublishPolicy::default(),
            unit: None,
            event_log: None,
            stats: Arc::new(PublishStats::default()),
        }
    }

    pub fn with_policy(mut self, policy: PublishPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_unit(mut self, unit: Option<String>) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_event_log(mut self, event_log: EventLog) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn stats(&self) -> Arc<PublishStats> {
        self.stats.clone()
    }

    /// Publish one event per binding of `tick`. Returns how many were accepted
    /// by the broker. Nothing here is retried.
    pub async fn handle_tick(&self, tick: &ResultTick) -> usize {
        let result = match AggregationResult::from_tick(tick) {
            Ok(result) => result,
            Err(e) => {
                self.stats.malformed_ticks.fetch_add(1, Ordering::Relaxed);
                warn!(query = %tick.query, window = %tick.window, error = %e, "ignoring result tick");
                return 0;
            }
        };

        let mut published = 0;
        for value in &result.values {
            let event = AggregationEvent::new(value.value, self.unit.clone());
            match self.publish(&event).await {
                Ok(()) => {
                    published += 1;
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        id = %event.id,
                        variable = %value.variable,
                        value = value.value,
                        topic = %self.topic,
                        "aggregation event published"
                    );
                    if let Some(log) = &self.event_log {
                        if let Err(e) = log.log(&value.lexical) {
                            warn!(path = %log.path().display(), error = %e, "failed to log result");
                        }
                    }
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(id = %event.id, error = %e, "dropping aggregation event");
                }
            }
        }
        published
    }

    async fn publish(&self, event: &AggregationEvent) -> Result<(), PublishError> {
        let payload = event.to_ntriples()?.into_bytes();
        match self.policy {
            PublishPolicy::DropWhenFull => self.broker.try_publish(&self.topic, payload)?,
            PublishPolicy::Wait => self.broker.publish(&self.topic, payload).await?,
        }
        Ok(())
    }

    /// Consume ticks until every sender is gone.
    pub fn spawn(self, mut ticks: mpsc::Receiver<ResultTick>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(tick) = ticks.recv().await {
                self.handle_tick(&tick).await;
            }
            info!(
                topic = %self.topic,
                published = self.stats.published(),
                failed = self.stats.failed(),
                "publisher stopped"
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Binding;

    fn tick(bindings: Vec<Binding>) -> ResultTick {
        ResultTick {
            query: "output#1".into(),
            window: "https://rsp.jsw1".into(),
            timestamp_from: 0,
            timestamp_to: 30_000,
            bindings,
        }
    }

    #[test]
    fn test_from_tick_rejects_empty_and_non_numeric() {
        assert!(matches!(
            AggregationResult::from_tick(&tick(vec![])),
            Err(PublishError::EmptyResult(_))
        ));
        assert!(matches!(
            AggregationResult::from_tick(&tick(vec![Binding::new("avgX", "abc")])),
            Err(PublishError::NonNumeric { .. })
        ));
    }

    #[test]
    fn test_from_tick_keeps_order() {
        let result = AggregationResult::from_tick(&tick(vec![
            Binding::new("avgX", "1.5"),
            Binding::new("avgY", "-2"),
        ]))
        .unwrap();
        let names: Vec<_> = result.values.iter().map(|v| v.variable.as_str()).collect();
        assert_eq!(names, ["avgX", "avgY"]);
        assert_eq!(result.values[1].value, -2.0);
    }

    #[test]
    fn test_event_ntriples() {
        let event = AggregationEvent::new(42.5, Some("http://qudt.org/vocab/unit/M-PER-SEC2".into()));
        assert!(event.id.starts_with(AGGREGATION_EVENT_BASE));
        let ntriples = event.to_ntriples().unwrap();
        let lines: Vec<_> = ntriples.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            format!(
                "<{}> <{SAREF_HAS_VALUE}> \"42.5\"^^<http://www.w3.org/2001/XMLSchema#float> .",
                event.id
            )
        );
        assert!(lines[1].ends_with("<http://qudt.org/vocab/unit/M-PER-SEC2> ."));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = AggregationEvent::new(1.0, None);
        let b = AggregationEvent::new(1.0, None);
        assert_ne!(a.id, b.id);
    }
}
