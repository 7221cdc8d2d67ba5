use super::{Registration, ResultTick, StreamHandle, WindowEngine};
use crate::engine::R2ROperator;
use crate::error::EngineError;
use crate::parsed_query::{ParsedQuery, WindowDefinition};
use crate::rspql_parser::RSPQLParser;
use crate::windowing::SlidingWindow;
use async_trait::async_trait;
use oxigraph::model::{GraphName, Literal, NamedNode, Quad};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// A registered query: its windows, its R2R operator and its result channel.
struct RegisteredQuery {
    id: String,
    r2r: R2ROperator,
    windows: Vec<(WindowDefinition, Arc<Mutex<SlidingWindow>>)>,
    sender: mpsc::Sender<ResultTick>,
    dropped_ticks: Arc<AtomicU64>,
}

impl RegisteredQuery {
    fn on_event(&self, index: usize, quads: &[Quad], timestamp: i64) -> Result<(), EngineError> {
        let (definition, window) = &self.windows[index];
        let closed = window.lock().add(quads, timestamp);
        let Some(closed) = closed else {
            return Ok(());
        };

        // Join with what the other windows of this query hold at the same instant
        let mut content = closed.content;
        let instant = closed.instance.close - 1;
        for (other_index, (_, other)) in self.windows.iter().enumerate() {
            if other_index == index {
                continue;
            }
            if let Some(other_content) = other.lock().content_at(instant) {
                content.merge(other_content);
            }
        }

        let bindings = self.r2r.execute(&content)?;
        debug!(
            query = %self.id,
            window = %definition.window_name,
            open = closed.instance.open,
            close = closed.instance.close,
            quads = content.len(),
            bindings = bindings.len(),
            "window closed"
        );

        let tick = ResultTick {
            query: self.id.clone(),
            window: definition.window_name.clone(),
            timestamp_from: closed.instance.open,
            timestamp_to: closed.instance.close,
            bindings,
        };
        match self.sender.try_send(tick) {
            Ok(()) => {}
            Err(TrySendError::Full(tick)) => {
                let dropped = self.dropped_ticks.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    query = %self.id,
                    close = tick.timestamp_to,
                    dropped,
                    "result queue full, dropping tick"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(query = %self.id, "result receiver dropped, discarding tick");
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
struct WindowTarget {
    query: Arc<RegisteredQuery>,
    index: usize,
}

/// Represents an RDF stream that feeds every window bound to it
#[derive(Clone)]
pub struct RDFStream {
    pub name: String,
    targets: Arc<RwLock<Vec<WindowTarget>>>,
}

impl RDFStream {
    fn new(name: String) -> Self {
        Self {
            name,
            targets: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Add the statements of one event to every window reading this stream.
    ///
    /// A failing evaluation for one window does not keep the event from the
    /// others; the first error is returned afterwards.
    pub fn add_quads(&self, quads: Vec<Quad>, timestamp: i64) -> Result<(), EngineError> {
        let targets = self.targets.read().clone();
        let mut first_error = None;
        for target in targets {
            if let Err(e) = target.query.on_event(target.index, &quads, timestamp) {
                warn!(stream = %self.name, query = %target.query.id, error = %e, "window evaluation failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn window_count(&self) -> usize {
        self.targets.read().len()
    }
}

impl StreamHandle for RDFStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, quads: Vec<Quad>, timestamp: i64) -> Result<(), EngineError> {
        self.add_quads(quads, timestamp)
    }
}

pub const DEFAULT_RESULT_CAPACITY: usize = 1_024;

/// The RSP (RDF Stream Processing) engine
///
/// Holds any number of registered queries. Streams are created on first
/// registration that reads them and shared between registrations.
///
/// Every registration gets a result queue of `result_capacity` ticks. The
/// engine never waits on a full queue: the tick is dropped and counted.
#[derive(Clone)]
pub struct RSPEngine {
    streams: Arc<RwLock<HashMap<String, RDFStream>>>,
    registered: Arc<AtomicUsize>,
    result_capacity: usize,
    dropped_ticks: Arc<AtomicU64>,
}

impl Default for RSPEngine {
    fn default() -> Self {
        Self::with_result_capacity(DEFAULT_RESULT_CAPACITY)
    }
}

impl RSPEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result_capacity(capacity: usize) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            registered: Arc::new(AtomicUsize::new(0)),
            result_capacity: capacity.max(1),
            dropped_ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Ticks dropped because a registration's result queue was full.
    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks.load(Ordering::Relaxed)
    }

    pub fn register_query(&self, query: &str) -> Result<Registration, EngineError> {
        let parsed = RSPQLParser::new(query).parse()?;
        if parsed.s2r.is_empty() {
            return Err(EngineError::InvalidQuerySyntax(
                "query declares no stream windows".into(),
            ));
        }

        let r2r = R2ROperator::new(parsed.sparql_query.clone());
        r2r.validate()?;

        let mut windows = Vec::with_capacity(parsed.s2r.len());
        for def in &parsed.s2r {
            let graph = NamedNode::new(def.window_name.as_str()).map_err(|e| {
                EngineError::InvalidQuerySyntax(format!("window {}: {e}", def.window_name))
            })?;
            windows.push((
                def.clone(),
                Arc::new(Mutex::new(SlidingWindow::new(graph, def.width, def.slide))),
            ));
        }

        let n = self.registered.fetch_add(1, Ordering::SeqCst) + 1;
        let id = if parsed.r2s.name.is_empty() {
            format!("query-{n}")
        } else {
            format!("{}#{n}", parsed.r2s.name)
        };

        let (sender, results) = mpsc::channel(self.result_capacity);
        let registered = Arc::new(RegisteredQuery {
            id: id.clone(),
            r2r,
            windows,
            sender,
            dropped_ticks: self.dropped_ticks.clone(),
        });

        let mut streams = self.streams.write();
        for (index, def) in parsed.s2r.iter().enumerate() {
            let stream = streams
                .entry(def.stream_name.clone())
                .or_insert_with(|| RDFStream::new(def.stream_name.clone()));
            stream.targets.write().push(WindowTarget {
                query: registered.clone(),
                index,
            });
        }
        drop(streams);

        info!(
            query = %id,
            windows = parsed.s2r.len(),
            "registered continuous query"
        );

        Ok(Registration {
            id,
            parsed,
            results,
        })
    }

    /// Get a stream by name (returns a clone sharing the same windows)
    pub fn get_stream(&self, stream_name: &str) -> Option<RDFStream> {
        self.streams.read().get(stream_name).cloned()
    }

    pub fn get_all_streams(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }

    /// Push a sentinel event so every window of the stream closes up to
    /// `final_timestamp`.
    pub fn close_stream(&self, stream_uri: &str, final_timestamp: i64) -> Result<(), EngineError> {
        let stream = self
            .get_stream(stream_uri)
            .ok_or_else(|| EngineError::UnknownStream(stream_uri.to_string()))?;
        let sentinel = Quad::new(
            NamedNode::new_unchecked("urn:rsp:sentinel"),
            NamedNode::new_unchecked("urn:rsp:type"),
            Literal::new_simple_literal("end"),
            GraphName::DefaultGraph,
        );
        stream.add_quads(vec![sentinel], final_timestamp)
    }
}

#[async_trait]
impl WindowEngine for RSPEngine {
    async fn parse(&self, query: &str) -> Result<ParsedQuery, EngineError> {
        RSPQLParser::new(query).parse()
    }

    async fn register(&self, query: &str) -> Result<Registration, EngineError> {
        self.register_query(query)
    }

    fn stream_handle(&self, stream_name: &str) -> Option<Arc<dyn StreamHandle>> {
        self.get_stream(stream_name)
            .map(|s| Arc::new(s) as Arc<dyn StreamHandle>)
    }
}
