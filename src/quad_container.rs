use oxigraph::model::{GraphName, NamedNode, Quad};
use std::collections::HashSet;

// Statements held by one window instance, with the event time of the last change.
#[derive(Debug, Clone, Default)]
pub struct QuadContainer {
    pub elements: HashSet<Quad>,
    pub last_timestamp_changed: i64,
}

impl QuadContainer {
    pub fn new(elements: HashSet<Quad>, ts: i64) -> Self {
        Self {
            elements,
            last_timestamp_changed: ts,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn add(&mut self, quad: Quad, ts: i64) {
        self.elements.insert(quad);
        self.last_timestamp_changed = ts;
    }

    /// Add a statement re-homed into `graph`, whatever graph it arrived in.
    pub fn add_in_graph(&mut self, quad: &Quad, graph: &NamedNode, ts: i64) {
        let rehomed = Quad::new(
            quad.subject.clone(),
            quad.predicate.clone(),
            quad.object.clone(),
            GraphName::NamedNode(graph.clone()),
        );
        self.add(rehomed, ts);
    }

    /// Union another container into this one, keeping the newer change time.
    pub fn merge(&mut self, other: &QuadContainer) {
        self.elements.extend(other.elements.iter().cloned());
        self.last_timestamp_changed = self
            .last_timestamp_changed
            .max(other.last_timestamp_changed);
    }

    pub fn contains(&self, quad: &Quad) -> bool {
        self.elements.contains(quad)
    }
}
