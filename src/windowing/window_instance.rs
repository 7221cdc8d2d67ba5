// Bounds of one window instance: `[open, close)` in event-time milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowInstance {
    pub open: i64,
    pub close: i64,
}

impl WindowInstance {
    pub fn new(open: i64, close: i64) -> Self {
        Self { open, close }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.open <= timestamp && timestamp < self.close
    }

    /// A window is complete once event time reaches its close boundary.
    pub fn is_complete_at(&self, timestamp: i64) -> bool {
        self.close <= timestamp
    }
}
