//! Wiring of one experiment run: registration, ingestion and publication.

use crate::broker::{Broker, BrokerConnector};
use crate::config::{Config, OutputConfig};
use crate::engine::{Registration, ResultTick, WindowEngine};
use crate::error::{Error, Result};
use crate::event_log::EventLog;
use crate::ingestion::{IngestionStats, SAREF_HAS_TIMESTAMP, StreamIngestionBridge};
use crate::orchestrator::Orchestrator;
use crate::publisher::{PublishStats, Publisher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// The accelerometer query joining the three axis streams.
pub const DEFAULT_COMBINED_QUERY: &str = r#"
PREFIX mqtt_broker: <mqtt://localhost:1883/>
PREFIX saref: <https://saref.etsi.org/core/>
PREFIX dahccsensors: <https://dahcc.idlab.ugent.be/Homelab/SensorsAndActuators/>
PREFIX : <https://rsp.js>
REGISTER RStream <output> AS
SELECT (AVG(?o) AS ?avgX) (AVG(?o2) AS ?avgY) (AVG(?o3) AS ?avgZ)
FROM NAMED WINDOW :w1 ON STREAM mqtt_broker:accX [RANGE 120000 STEP 30000]
FROM NAMED WINDOW :w2 ON STREAM mqtt_broker:accY [RANGE 120000 STEP 30000]
FROM NAMED WINDOW :w3 ON STREAM mqtt_broker:accZ [RANGE 120000 STEP 30000]
WHERE {
    { WINDOW :w1 {
        ?s saref:hasValue ?o .
        ?s saref:relatesToProperty dahccsensors:x .
    }}
    UNION
    { WINDOW :w2 {
        ?s saref:hasValue ?o2 .
        ?s saref:relatesToProperty dahccsensors:y .
    }}
    UNION
    { WINDOW :w3 {
        ?s saref:hasValue ?o3 .
        ?s saref:relatesToProperty dahccsensors:z .
    }}
}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ApproachKind {
    /// Independent per-stream sub-queries
    Approximation,
    /// The combined query registered as is
    Exact,
}

impl ApproachKind {
    pub fn name(&self) -> &'static str {
        match self {
            ApproachKind::Approximation => "approximation",
            ApproachKind::Exact => "exact",
        }
    }

    /// Event log entry written once the queries are registered.
    pub fn registered_marker(&self) -> &'static str {
        match self {
            ApproachKind::Approximation => "approximation_query_registered",
            ApproachKind::Exact => "exact_query_registered",
        }
    }

    /// The query texts this approach registers, in registration order.
    pub fn queries(&self, config: &Config) -> Result<Vec<String>> {
        let combined = config.combined_query()?;
        match self {
            ApproachKind::Exact => Ok(vec![combined]),
            ApproachKind::Approximation => {
                let mut orchestrator = Orchestrator::new();
                if config.queries.sub_queries.is_empty() {
                    orchestrator = Orchestrator::from_combined(&combined, &config.decomposition)?;
                } else {
                    for query in &config.queries.sub_queries {
                        orchestrator.add_sub_query(query.clone());
                    }
                }
                Ok(orchestrator
                    .get_sub_queries()
                    .into_iter()
                    .map(|q| q.text)
                    .collect())
            }
        }
    }
}

/// Everything needed to start one run.
pub struct Approach {
    kind: ApproachKind,
    queries: Vec<String>,
    engine: Arc<dyn WindowEngine>,
    connector: Arc<dyn BrokerConnector>,
    output_broker: Arc<dyn Broker>,
    output: OutputConfig,
    timestamp_predicate: String,
    event_log: EventLog,
}

impl Approach {
    pub fn new(
        kind: ApproachKind,
        queries: Vec<String>,
        engine: Arc<dyn WindowEngine>,
        connector: Arc<dyn BrokerConnector>,
        output_broker: Arc<dyn Broker>,
        event_log: EventLog,
    ) -> Self {
        Self {
            kind,
            queries,
            engine,
            connector,
            output_broker,
            output: OutputConfig::default(),
            timestamp_predicate: SAREF_HAS_TIMESTAMP.to_string(),
            event_log,
        }
    }

    pub fn with_output(mut self, output: OutputConfig) -> Self {
        self.output = output;
        self
    }

    pub fn with_timestamp_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.timestamp_predicate = predicate.into();
        self
    }

    /// Register every query, then start publication and ingestion.
    ///
    /// A query that fails to register is logged and skipped; the run only
    /// fails when none registers.
    pub async fn start(self) -> Result<RunningApproach> {
        let bridge = StreamIngestionBridge::new(self.engine.clone(), self.connector.clone())
            .with_timestamp_predicate(&self.timestamp_predicate)?;

        let mut registrations: Vec<Registration> = Vec::with_capacity(self.queries.len());
        for (index, query) in self.queries.iter().enumerate() {
            match self.engine.register(query).await {
                Ok(registration) => registrations.push(registration),
                Err(e) => error!(approach = self.kind.name(), index, error = %e, "query registration failed"),
            }
        }
        if registrations.is_empty() {
            return Err(Error::NothingRegistered);
        }
        self.event_log
            .log(self.kind.registered_marker())
            .map_err(|e| Error::EventLog(e.to_string()))?;

        let registered: Vec<String> = registrations.iter().map(|r| r.id.clone()).collect();
        info!(approach = self.kind.name(), queries = ?registered, "queries registered");

        let (tx, rx) = mpsc::channel::<ResultTick>(self.output.queue_capacity.max(1));
        let parsed: Vec<_> = registrations.iter().map(|r| r.parsed.clone()).collect();
        let forwarders: Vec<JoinHandle<()>> = registrations
            .into_iter()
            .map(|registration| {
                let tx = tx.clone();
                let mut results = registration.results;
                tokio::spawn(async move {
                    while let Some(tick) = results.recv().await {
                        if tx.send(tick).await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        drop(tx);

        let publisher = Publisher::new(self.output_broker.clone(), self.output.topic.clone())
            .with_policy(self.output.policy)
            .with_unit(self.output.unit.clone())
            .with_event_log(self.event_log.clone());
        let publish_stats = publisher.stats();
        let publisher = publisher.spawn(rx);

        let ingestion_stats = bridge.stats();
        let bindings = StreamIngestionBridge::stream_bindings(&parsed);
        let ingestion = match bridge.start(&bindings).await {
            Ok(ingestion) => ingestion,
            Err(e) => {
                error!(approach = self.kind.name(), error = %e, "ingestion failed to start, stopping run");
                stop_tasks(Vec::new(), forwarders, publisher).await;
                return Err(e);
            }
        };

        Ok(RunningApproach {
            kind: self.kind,
            registered,
            ingestion,
            forwarders,
            publisher,
            ingestion_stats,
            publish_stats,
        })
    }
}

pub struct RunningApproach {
    kind: ApproachKind,
    registered: Vec<String>,
    ingestion: Vec<JoinHandle<()>>,
    forwarders: Vec<JoinHandle<()>>,
    publisher: JoinHandle<()>,
    ingestion_stats: Arc<IngestionStats>,
    publish_stats: Arc<PublishStats>,
}

impl RunningApproach {
    pub fn kind(&self) -> ApproachKind {
        self.kind
    }

    /// Ids of the registered queries, in registration order.
    pub fn registered(&self) -> &[String] {
        &self.registered
    }

    pub fn ingestion_stats(&self) -> Arc<IngestionStats> {
        self.ingestion_stats.clone()
    }

    pub fn publish_stats(&self) -> Arc<PublishStats> {
        self.publish_stats.clone()
    }

    /// Stop ingesting, let the publisher drain what is queued, and wait for it.
    pub async fn shutdown(self) {
        stop_tasks(self.ingestion, self.forwarders, self.publisher).await;
        info!(
            approach = self.kind.name(),
            accepted = self.ingestion_stats.accepted(),
            dropped = self.ingestion_stats.dropped(),
            published = self.publish_stats.published(),
            failed = self.publish_stats.failed(),
            "run stopped"
        );
    }
}

/// Abort ingestion and forwarding, then let the publisher drain what is
/// already queued.
async fn stop_tasks(
    ingestion: Vec<JoinHandle<()>>,
    forwarders: Vec<JoinHandle<()>>,
    publisher: JoinHandle<()>,
) {
    for handle in ingestion.iter().chain(forwarders.iter()) {
        handle.abort();
    }
    for handle in ingestion.into_iter().chain(forwarders) {
        let _ = handle.await;
    }
    if let Err(e) = publisher.await {
        error!(error = %e, "publisher task failed");
    }
}
