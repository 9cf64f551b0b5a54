//! Output batch sizing
//!
//! Streamed results are grouped before they are sent to the host. Batches
//! start small so the first tokens arrive quickly, then grow geometrically
//! up to a ceiling to cut per-message overhead on long generations.

use llmrelay_common::config::BatchingConfig;
use tracing::trace;

/// How batch sizes evolve over one job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchPolicy {
    /// Ceiling (and the fixed size when growth is disabled)
    pub max_batch_size: usize,

    /// Starting size when growth is enabled
    pub min_batch_size: usize,

    /// Multiplier applied after each emitted batch
    pub growth_factor: f64,
}

impl BatchPolicy {
    pub fn from_config(config: &BatchingConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            min_batch_size: config.min_batch_size,
            growth_factor: config.batch_size_growth_factor,
        }
    }

    /// Growth applies only with a factor above one and a real range to grow in
    pub fn is_dynamic(&self) -> bool {
        self.growth_factor > 1.0
            && self.min_batch_size >= 1
            && self.max_batch_size > self.min_batch_size
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::from_config(&BatchingConfig::default())
    }
}

/// Current batch size for one job
#[derive(Debug, Clone)]
pub struct BatchSize {
    policy: BatchPolicy,
    current: usize,
}

impl BatchSize {
    pub fn new(policy: BatchPolicy) -> Self {
        let current = if policy.is_dynamic() {
            policy.min_batch_size
        } else {
            policy.max_batch_size
        };

        Self {
            policy,
            current: current.max(1),
        }
    }

    /// Number of items that completes the current batch
    pub fn current(&self) -> usize {
        self.current
    }

    /// Advance after a batch was emitted.
    ///
    /// Fractional growth rounds up so a factor like 1.5 still moves a size
    /// of one forward.
    pub fn grow(&mut self) {
        if !self.policy.is_dynamic() {
            return;
        }

        let grown = (self.current as f64 * self.policy.growth_factor).ceil() as usize;
        self.current = grown.min(self.policy.max_batch_size).max(1);
        trace!("Batch size grown to {}", self.current);
    }
}
