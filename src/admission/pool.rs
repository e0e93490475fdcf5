use crate::analytics::PoolStats;
use crate::limiter::{PacingClock, RateWindow};

/// Per-pool limiter state. Created on first reference, kept for the process lifetime.
#[derive(Debug)]
pub(crate) struct Pool {
    name: String,
    pub(crate) window: RateWindow,
    /// Spaces this pool's dispatches by its `min_delay_ms`.
    pub(crate) pacer: PacingClock,
    pub(crate) stats: PoolStats,
}

impl Pool {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            window: RateWindow::new(),
            pacer: PacingClock::new(),
            stats: PoolStats::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}
