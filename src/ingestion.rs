//! Broker-to-engine bridge: one subscription task per declared input stream.
//!
//! Each inbound message is parsed as Turtle into a [`StreamEvent`], stamped
//! with the event time carried by its timestamp statement, and added to the
//! engine's stream of the same name. A message that cannot be turned into an
//! event is logged and dropped; the subscription keeps running.

use crate::broker::{BrokerConnector, BrokerEndpoint};
use crate::engine::WindowEngine;
use crate::error::{EngineError, Error, IngestError};
use crate::parsed_query::{ParsedQuery, WindowDefinition};
use chrono::{DateTime, NaiveDateTime};
use oxigraph::io::{RdfFormat, RdfParser};
use oxigraph::model::{NamedNode, Quad, Term};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const SAREF_HAS_TIMESTAMP: &str = "https://saref.etsi.org/core/hasTimestamp";

/// The result variable a stream's readings populate in the combined query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSlot {
    O,
    O2,
    O3,
}

impl ValueSlot {
    pub fn variable(&self) -> &'static str {
        match self {
            ValueSlot::O => "o",
            ValueSlot::O2 => "o2",
            ValueSlot::O3 => "o3",
        }
    }
}

/// Select the value slot from the terminal character of a stream name:
/// `...Y` feeds `?o2`, `...Z` feeds `?o3`, everything else `?o`.
pub fn value_slot(stream_name: &str) -> ValueSlot {
    match stream_name.trim_end_matches('/').chars().last() {
        Some('Y') | Some('y') => ValueSlot::O2,
        Some('Z') | Some('z') => ValueSlot::O3,
        _ => ValueSlot::O,
    }
}

#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub stream: String,
    pub quads: Vec<Quad>,
    pub timestamp_ms: i64,
    pub value_slot: ValueSlot,
}

impl StreamEvent {
    pub fn parse(
        stream: &str,
        payload: &[u8],
        timestamp_predicate: &NamedNode,
    ) -> Result<Self, IngestError> {
        let quads = RdfParser::from_format(RdfFormat::Turtle)
            .for_reader(payload)
            .collect::<Result<Vec<Quad>, _>>()
            .map_err(|e| IngestError::MalformedEvent(e.to_string()))?;
        if quads.is_empty() {
            return Err(IngestError::MalformedEvent("payload has no statements".into()));
        }
        let timestamp_ms = extract_timestamp(&quads, timestamp_predicate)?;
        Ok(Self {
            stream: stream.to_string(),
            quads,
            timestamp_ms,
            value_slot: value_slot(stream),
        })
    }
}

/// Event time in epoch milliseconds from the first `predicate` statement.
///
/// Accepts RFC 3339 date-times, zone-less date-times (read as UTC) and plain
/// integer milliseconds.
pub fn extract_timestamp(quads: &[Quad], predicate: &NamedNode) -> Result<i64, IngestError> {
    let quad = quads
        .iter()
        .find(|q| &q.predicate == predicate)
        .ok_or_else(|| IngestError::MissingTimestamp(predicate.as_str().to_string()))?;
    let raw = match &quad.object {
        Term::Literal(literal) => literal.value(),
        other => {
            return Err(IngestError::MalformedEvent(format!(
                "timestamp object {other} is not a literal"
            )));
        }
    };
    parse_timestamp(raw)
        .ok_or_else(|| IngestError::InvalidTimestamp(raw.to_string()))
}

fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc().timestamp_millis());
    }
    raw.parse::<i64>().ok()
}

#[derive(Debug, Default)]
pub struct IngestionStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
    evaluation_failures: AtomicU64,
}

impl IngestionStats {
    /// Events added to the engine's windows.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Events that never reached the engine.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Accepted events whose window evaluation failed for some query.
    pub fn evaluation_failures(&self) -> u64 {
        self.evaluation_failures.load(Ordering::Relaxed)
    }
}

/// An event added to the engine, and the evaluation error it caused, if any.
#[derive(Debug)]
pub struct Ingested {
    pub event: StreamEvent,
    pub evaluation_error: Option<EngineError>,
}

/// Subscribes to the broker topic of every declared stream and feeds the
/// window engine.
pub struct StreamIngestionBridge {
    engine: Arc<dyn WindowEngine>,
    connector: Arc<dyn BrokerConnector>,
    timestamp_predicate: NamedNode,
    stats: Arc<IngestionStats>,
}

impl StreamIngestionBridge {
    pub fn new(engine: Arc<dyn WindowEngine>, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            engine,
            connector,
            timestamp_predicate: NamedNode::new_unchecked(SAREF_HAS_TIMESTAMP),
            stats: Arc::new(IngestionStats::default()),
        }
    }

    pub fn with_timestamp_predicate(mut self, predicate: &str) -> Result<Self, IngestError> {
        self.timestamp_predicate = NamedNode::new(predicate).map_err(|e| {
            IngestError::MalformedEvent(format!("invalid timestamp predicate {predicate}: {e}"))
        })?;
        Ok(self)
    }

    pub fn stats(&self) -> Arc<IngestionStats> {
        self.stats.clone()
    }

    /// Every stream window binding of the given queries, one per stream,
    /// in declaration order.
    pub fn stream_bindings(queries: &[ParsedQuery]) -> Vec<WindowDefinition> {
        let mut seen = HashSet::new();
        queries
            .iter()
            .flat_map(|q| q.s2r.iter())
            .filter(|w| seen.insert(w.stream_name.clone()))
            .cloned()
            .collect()
    }

    /// Subscribe to every stream and spawn its message loop.
    ///
    /// Connection and subscription failures are returned; once running, a
    /// task only ends when its subscription closes.
    ///
    /// If any stream fails to start, the loops already spawned are stopped
    /// before the error is returned.
    pub async fn start(&self, bindings: &[WindowDefinition]) -> Result<Vec<JoinHandle<()>>, Error> {
        let mut handles = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match self.spawn_stream(binding).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(stream = %binding.stream_name, error = %e, "stream ingestion failed to start");
                    for handle in &handles {
                        handle.abort();
                    }
                    for handle in handles {
                        let _ = handle.await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    async fn spawn_stream(&self, binding: &WindowDefinition) -> Result<JoinHandle<()>, Error> {
        let stream = binding.stream_name.clone();
        let endpoint = BrokerEndpoint::from_stream_uri(&stream)?;
        let broker = self.connector.connect(&endpoint).await?;
        let mut messages = broker.subscribe(&endpoint.topic).await?;
        info!(
            stream = %stream,
            broker = %endpoint.broker_url(),
            topic = %endpoint.topic,
            "ingesting stream"
        );

        let engine = self.engine.clone();
        let predicate = self.timestamp_predicate.clone();
        let stats = self.stats.clone();
        Ok(tokio::spawn(async move {
            // Keeps the connection alive for as long as the loop runs
            let _broker = broker;
            while let Some(message) = messages.recv().await {
                match ingest(engine.as_ref(), &stream, &message.payload, &predicate) {
                    Ok(Ingested {
                        event,
                        evaluation_error,
                    }) => {
                        stats.accepted.fetch_add(1, Ordering::Relaxed);
                        if let Some(e) = evaluation_error {
                            stats.evaluation_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                stream = %stream,
                                timestamp = event.timestamp_ms,
                                error = %e,
                                "event ingested, window evaluation failed"
                            );
                        }
                        debug!(
                            stream = %stream,
                            timestamp = event.timestamp_ms,
                            slot = event.value_slot.variable(),
                            statements = event.quads.len(),
                            "event ingested"
                        );
                    }
                    Err(e) => {
                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(stream = %stream, error = %e, "dropping event");
                    }
                }
            }
            info!(stream = %stream, "subscription closed");
        }))
    }
}

/// Parse one payload and add it to the engine's stream.
///
/// Fails only when the event never reaches the engine. A window evaluation
/// failure after the statements were added is returned with the event.
pub fn ingest(
    engine: &dyn WindowEngine,
    stream: &str,
    payload: &[u8],
    timestamp_predicate: &NamedNode,
) -> Result<Ingested, IngestError> {
    let event = StreamEvent::parse(stream, payload, timestamp_predicate)?;
    let handle = engine
        .stream_handle(stream)
        .ok_or_else(|| EngineError::UnknownStream(stream.to_string()))?;
    let evaluation_error = handle.add(event.quads.clone(), event.timestamp_ms).err();
    Ok(Ingested {
        event,
        evaluation_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicate() -> NamedNode {
        NamedNode::new_unchecked(SAREF_HAS_TIMESTAMP)
    }

    #[test]
    fn test_value_slot_from_stream_suffix() {
        assert_eq!(value_slot("mqtt://localhost:1883/accX"), ValueSlot::O);
        assert_eq!(value_slot("mqtt://localhost:1883/accY"), ValueSlot::O2);
        assert_eq!(value_slot("mqtt://localhost:1883/accZ"), ValueSlot::O3);
        assert_eq!(ValueSlot::O3.variable(), "o3");
    }

    #[test]
    fn test_parse_event_with_datetime() {
        let payload = br#"
            @prefix saref: <https://saref.etsi.org/core/> .
            <https://example.org/obs/1> saref:hasValue "0.5"^^<http://www.w3.org/2001/XMLSchema#float> ;
                saref:hasTimestamp "2024-01-01T00:00:01.500Z"^^<http://www.w3.org/2001/XMLSchema#dateTime> .
        "#;
        let event = StreamEvent::parse("mqtt://localhost:1883/accX", payload, &predicate()).unwrap();
        assert_eq!(event.quads.len(), 2);
        assert_eq!(event.timestamp_ms, 1_704_067_201_500);
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(parse_timestamp("1704067200000"), Some(1_704_067_200_000));
        assert_eq!(parse_timestamp("2024-01-01T00:00:00"), Some(1_704_067_200_000));
        assert_eq!(
            parse_timestamp("2024-01-01T01:00:00+01:00"),
            Some(1_704_067_200_000)
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_missing_timestamp() {
        let payload = br#"<https://example.org/obs/1> <https://saref.etsi.org/core/hasValue> "0.5" ."#;
        assert!(matches!(
            StreamEvent::parse("accX", payload, &predicate()),
            Err(IngestError::MissingTimestamp(_))
        ));
    }

    #[test]
    fn test_unreadable_timestamp_is_invalid() {
        let payload = br#"<https://example.org/obs/1> <https://saref.etsi.org/core/hasTimestamp> "yesterday" ."#;
        match StreamEvent::parse("accX", payload, &predicate()) {
            Err(IngestError::InvalidTimestamp(raw)) => assert_eq!(raw, "yesterday"),
            other => panic!("expected an invalid timestamp, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        assert!(matches!(
            StreamEvent::parse("accX", b"not turtle at all {", &predicate()),
            Err(IngestError::MalformedEvent(_))
        ));
        assert!(matches!(
            StreamEvent::parse("accX", b"", &predicate()),
            Err(IngestError::MalformedEvent(_))
        ));
    }
}
