//! Registry of sub-queries and the policy that splits a combined
//! multi-window query into independent single-window sub-queries.

use crate::error::EngineError;
use crate::parsed_query::{ParsedQuery, Projection, WindowDefinition};
use crate::rspql_parser::RSPQLParser;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{debug, warn};

/// A query to register on its own, with the windows it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubQuery {
    pub text: String,
    pub windows: Vec<WindowDefinition>,
}

impl SubQuery {
    /// Windows are read from the text when it parses and left empty when it
    /// does not; syntax errors surface at registration.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let windows = match RSPQLParser::new(text.as_str()).parse() {
            Ok(parsed) => parsed.s2r,
            Err(e) => {
                debug!(error = %e, "sub-query text does not parse yet");
                Vec::new()
            }
        };
        Self { text, windows }
    }
}

/// Window parameters given to every decomposed sub-query. `None` keeps the
/// combined query's own value.
///
/// The default applies only when no policy is given at all. A field left out
/// of a given policy is `None`, so an empty `[decomposition]` table keeps
/// every window as declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompositionPolicy {
    pub range_ms: Option<i64>,
    pub step_ms: Option<i64>,
}

impl Default for DecompositionPolicy {
    fn default() -> Self {
        Self {
            range_ms: Some(60_000),
            step_ms: Some(60_000),
        }
    }
}

impl DecompositionPolicy {
    /// Keep each window exactly as declared in the combined query.
    pub fn preserve() -> Self {
        Self {
            range_ms: None,
            step_ms: None,
        }
    }

    fn apply(&self, window: &WindowDefinition) -> WindowDefinition {
        WindowDefinition {
            width: self.range_ms.unwrap_or(window.width),
            slide: self.step_ms.unwrap_or(window.slide),
            ..window.clone()
        }
    }
}

/// Ordered registry of sub-queries. Does not validate or run them.
#[derive(Debug, Default)]
pub struct Orchestrator {
    sub_queries: Vec<SubQuery>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decompose `combined` and register every resulting sub-query.
    pub fn from_combined(combined: &str, policy: &DecompositionPolicy) -> Result<Self, EngineError> {
        let mut orchestrator = Self::new();
        for sub_query in decompose(combined, policy)? {
            orchestrator.push(sub_query);
        }
        Ok(orchestrator)
    }

    pub fn add_sub_query(&mut self, text: impl Into<String>) {
        self.push(SubQuery::new(text));
    }

    pub fn push(&mut self, sub_query: SubQuery) {
        debug!(index = self.sub_queries.len(), "sub-query added");
        self.sub_queries.push(sub_query);
    }

    /// Snapshot of the registry in insertion order.
    pub fn get_sub_queries(&self) -> Vec<SubQuery> {
        self.sub_queries.clone()
    }

    pub fn len(&self) -> usize {
        self.sub_queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_queries.is_empty()
    }
}

/// Split a multi-window query into one query per window.
///
/// Each sub-query keeps the prefixes and the `REGISTER` clause, projects the
/// aggregates whose input variable occurs in that window's block, and reads
/// only that window, with range and step taken from `policy`. Windows whose
/// block binds none of the projected variables yield no sub-query.
pub fn decompose(combined: &str, policy: &DecompositionPolicy) -> Result<Vec<SubQuery>, EngineError> {
    let parsed = RSPQLParser::new(combined).parse()?;
    let mut sub_queries = Vec::with_capacity(parsed.s2r.len());

    for window in &parsed.s2r {
        let Some(block) = parsed.block(&window.window_name) else {
            warn!(window = %window.window_name, "window has no WINDOW block, skipping");
            continue;
        };
        let projections = parsed.projections_in(block);
        if projections.is_empty() {
            warn!(window = %window.window_name, "no projected variable is bound in window, skipping");
            continue;
        }
        let window = policy.apply(window);
        let text = render_sub_query(&parsed, &projections, &window, &block.body);
        sub_queries.push(SubQuery {
            text,
            windows: vec![window],
        });
    }
    Ok(sub_queries)
}

fn render_sub_query(
    parsed: &ParsedQuery,
    projections: &[&Projection],
    window: &WindowDefinition,
    body: &str,
) -> String {
    let mut out = String::new();
    for (prefix, iri) in &parsed.prefixes {
        let _ = writeln!(out, "PREFIX {prefix}: <{iri}>");
    }
    if !parsed.r2s.name.is_empty() {
        let _ = writeln!(out, "REGISTER {} <{}> AS", parsed.r2s.operator, parsed.r2s.name);
    }
    let select: Vec<String> = projections.iter().map(|p| p.text()).collect();
    let _ = writeln!(out, "SELECT {}", select.join(" "));
    let _ = writeln!(
        out,
        "FROM NAMED WINDOW <{}> ON STREAM <{}> [RANGE {} STEP {}]",
        window.window_name, window.stream_name, window.width, window.slide
    );
    let _ = writeln!(out, "WHERE {{");
    let _ = writeln!(out, "    WINDOW <{}> {{", window.window_name);
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let _ = writeln!(out, "        {line}");
    }
    let _ = writeln!(out, "    }}");
    out.push('}');
    out
}
