//! Engine configuration.

use std::time::Duration;

/// Engine tuning shared by every registered machine.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Longest chain of entry callbacks requesting another transition before
    /// the chain is treated as a handler failure.
    pub max_transition_chain: usize,
    /// Interval between warnings while waiting for a worker to acknowledge a
    /// stop request.
    pub worker_stop_warn: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_transition_chain: 64,
            worker_stop_warn: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn with_max_transition_chain(mut self, hops: usize) -> Self {
        self.max_transition_chain = hops;
        self
    }

    pub fn with_worker_stop_warn(mut self, interval: Duration) -> Self {
        self.worker_stop_warn = interval;
        self
    }
}
