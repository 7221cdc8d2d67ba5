use super::WindowInstance;
use crate::quad_container::QuadContainer;
use oxigraph::model::{NamedNode, Quad};
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Content of a window instance that has just closed.
#[derive(Debug, Clone)]
pub struct ClosedWindow {
    pub instance: WindowInstance,
    pub content: QuadContainer,
}

/// Time-driven sliding window reporting on window close.
///
/// Instances open at `t0 + k * slide` where `t0` is the first event time the
/// window sees, and span `width` milliseconds. Statements are stored in the
/// window's named graph so that a `GRAPH <window>` pattern matches them.
pub struct SlidingWindow {
    pub name: String,
    pub width: i64,
    pub slide: i64,
    graph: NamedNode,
    t0: Option<i64>,
    time: i64,
    active_windows: BTreeMap<WindowInstance, QuadContainer>,
}

impl SlidingWindow {
    pub fn new(name: NamedNode, width: i64, slide: i64) -> Self {
        Self {
            name: name.as_str().to_string(),
            width,
            slide,
            graph: name,
            t0: None,
            time: i64::MIN,
            active_windows: BTreeMap::new(),
        }
    }

    /// Add the statements of one event.
    ///
    /// Returns the content of the latest instance completed by this event, if
    /// any instance completed and it was non-empty. Every completed instance
    /// is evicted.
    pub fn add(&mut self, quads: &[Quad], timestamp: i64) -> Option<ClosedWindow> {
        if timestamp < self.time {
            warn!(
                window = %self.name,
                timestamp,
                watermark = self.time,
                "out-of-order event, processing anyway"
            );
        }
        self.time = self.time.max(timestamp);

        self.scope(timestamp);

        for (window, container) in self.active_windows.iter_mut() {
            if window.contains(timestamp) {
                for quad in quads {
                    container.add_in_graph(quad, &self.graph, timestamp);
                }
            }
        }

        let completed: Vec<WindowInstance> = self
            .active_windows
            .keys()
            .filter(|w| w.is_complete_at(timestamp))
            .copied()
            .collect();

        let mut report = None;
        if let Some(latest) = completed.iter().max_by_key(|w| w.close) {
            if let Some(content) = self.active_windows.get(latest) {
                if content.is_empty() {
                    trace!(window = %self.name, open = latest.open, close = latest.close, "empty window closed");
                } else {
                    report = Some(ClosedWindow {
                        instance: *latest,
                        content: content.clone(),
                    });
                }
            }
        }

        for window in &completed {
            trace!(window = %self.name, open = window.open, close = window.close, "evicting");
            self.active_windows.remove(window);
        }

        report
    }

    /// Open every instance that should contain `t_e` and is still open at `t_e`.
    fn scope(&mut self, t_e: i64) {
        let t0 = *self.t0.get_or_insert(t_e);

        let delta = t_e - t0;
        let mut steps = delta.div_euclid(self.slide);
        if delta.rem_euclid(self.slide) != 0 {
            steps += 1;
        }
        let c_sup = t0 + steps * self.slide;

        let mut o_i = c_sup - self.width;
        while o_i <= t_e {
            let window = WindowInstance::new(o_i, o_i + self.width);
            if !window.is_complete_at(t_e) {
                self.active_windows.entry(window).or_default();
            }
            o_i += self.slide;
        }
    }

    /// Content of the earliest-closing instance that contains `timestamp`.
    pub fn content_at(&self, timestamp: i64) -> Option<&QuadContainer> {
        self.active_windows
            .iter()
            .filter(|(w, _)| w.contains(timestamp))
            .min_by_key(|(w, _)| w.close)
            .map(|(_, c)| c)
    }

    pub fn active_window_count(&self) -> usize {
        self.active_windows.len()
    }

    pub fn active_window_ranges(&self) -> Vec<(i64, i64)> {
        self.active_windows
            .keys()
            .map(|w| (w.open, w.close))
            .collect()
    }
}
