//! The window/query engine capability and its in-crate implementation.
//!
//! Ingestion and publication only talk to [`WindowEngine`] and
//! [`StreamHandle`], so the engine can be swapped or mocked.

mod r2r;
mod rsp_engine;

pub use r2r::R2ROperator;
pub use rsp_engine::{DEFAULT_RESULT_CAPACITY, RDFStream, RSPEngine};

use crate::error::EngineError;
use crate::parsed_query::ParsedQuery;
use async_trait::async_trait;
use oxigraph::model::Quad;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One variable bound by a query solution, in lexical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub variable: String,
    pub value: String,
}

impl Binding {
    pub fn new(variable: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            value: value.into(),
        }
    }
}

/// Emitted once per window close: every variable bound by the R2R evaluation
/// of the closed window, in solution order.
#[derive(Debug, Clone)]
pub struct ResultTick {
    pub query: String,
    pub window: String,
    pub timestamp_from: i64,
    pub timestamp_to: i64,
    pub bindings: Vec<Binding>,
}

/// A successful registration and the stream of its result ticks.
pub struct Registration {
    pub id: String,
    pub parsed: ParsedQuery,
    pub results: mpsc::Receiver<ResultTick>,
}

/// Write side of a named input stream. Must tolerate concurrent callers.
pub trait StreamHandle: Send + Sync {
    fn name(&self) -> &str;

    fn add(&self, quads: Vec<Quad>, timestamp: i64) -> Result<(), EngineError>;
}

#[async_trait]
pub trait WindowEngine: Send + Sync {
    async fn parse(&self, query: &str) -> Result<ParsedQuery, EngineError>;

    /// Register a continuous query. Syntax errors surface here as
    /// [`EngineError::InvalidQuerySyntax`].
    async fn register(&self, query: &str) -> Result<Registration, EngineError>;

    fn stream_handle(&self, stream_name: &str) -> Option<Arc<dyn StreamHandle>>;
}
