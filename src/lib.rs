//! Approximate evaluation of windowed aggregation queries over correlated
//! RDF sensor streams.
//!
//! A combined multi-stream query is split by the [`orchestrator`] into
//! independent per-stream sub-queries. The [`ingestion`] bridge feeds broker
//! messages into the window [`engine`], the [`publisher`] republishes every
//! closed window's aggregates, and the [`resource_monitor`] and
//! [`event_log`] record what the offline [`analyzer`] needs to compare the
//! approximation against the exact combined query.

pub mod analyzer;
pub mod approach;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod ingestion;
pub mod orchestrator;
pub mod parsed_query;
pub mod publisher;
pub mod quad_container;
pub mod resource_monitor;
pub mod rspql_parser;
pub mod telemetry;
pub mod windowing;

pub use analyzer::{Analyzer, AnalyzerConfig, LatencySummaryRow};
pub use approach::{Approach, ApproachKind, RunningApproach};
pub use broker::{Broker, BrokerConnector, BrokerEndpoint, MemoryBroker, MqttConnector};
pub use config::Config;
pub use engine::{Binding, RSPEngine, ResultTick, StreamHandle, WindowEngine};
pub use error::{Error, Result};
pub use event_log::EventLog;
pub use ingestion::{StreamEvent, StreamIngestionBridge};
pub use orchestrator::{DecompositionPolicy, Orchestrator, SubQuery};
pub use parsed_query::{ParsedQuery, WindowDefinition};
pub use publisher::{AggregationEvent, AggregationResult, PublishPolicy, Publisher};
pub use quad_container::QuadContainer;
pub use resource_monitor::{ResourceMonitor, ResourceUsageLogger};
pub use rspql_parser::RSPQLParser;
pub use windowing::{SlidingWindow, WindowInstance};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
