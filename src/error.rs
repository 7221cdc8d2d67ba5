use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the window engine and its RSP-QL parser.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid query syntax: {0}")]
    InvalidQuerySyntax(String),

    #[error("stream {0} is not bound to any registered window")]
    UnknownStream(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("query evaluation failed: {0}")]
    Evaluation(String),
}

/// Per-message ingestion failures. None of these stop a subscription.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("event has no {0} statement")]
    MissingTimestamp(String),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("unparseable timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid broker endpoint {uri}: {reason}")]
    InvalidEndpoint { uri: String, reason: String },

    #[error("connection to {0} failed: {1}")]
    Connection(String, String),

    #[error("subscription to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("publish to {topic} failed: {reason}")]
    PublishFailure { topic: String, reason: String },
}

/// A result tick that cannot be turned into outbound events.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("result tick from {0} carries no bindings")]
    EmptyResult(String),

    #[error("binding ?{variable} has non-numeric value {value:?}")]
    NonNumeric { variable: String, value: String },

    #[error("cannot build aggregation event: {0}")]
    Statement(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("missing log file {0}")]
    MissingLogFile(PathBuf),

    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("CSV error in {0}: {1}")]
    Csv(PathBuf, #[source] csv::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("cannot open resource log {0}: {1}")]
    Open(PathBuf, #[source] std::io::Error),

    #[error("resource log write failed: {0}")]
    Write(#[from] csv::Error),

    #[error("resource sampler task failed: {0}")]
    Join(String),
}

/// Top-level error for the orchestration layer and the binary.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("event log error: {0}")]
    EventLog(String),

    #[error("no sub-query could be registered")]
    NothingRegistered,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
