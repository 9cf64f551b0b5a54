//! Concurrency advertiser
//!
//! Tells the host how many jobs this worker takes at once. The answer comes
//! straight from the engine on every call, so a change in the engine's
//! policy is picked up without restarting.

use std::sync::Arc;

use llmrelay_host::ConcurrencyModifier;

use crate::engine::InferenceEngine;

pub struct ConcurrencyAdvertiser {
    engine: Arc<dyn InferenceEngine>,
}

impl ConcurrencyAdvertiser {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self { engine }
    }

    /// Permitted in-flight jobs. `_hint` is the host's current value and is
    /// not consulted.
    pub fn current(&self, _hint: usize) -> usize {
        self.engine.max_concurrency()
    }

    /// Hook handed to the host
    pub fn modifier(self: &Arc<Self>) -> ConcurrencyModifier {
        let advertiser = Arc::clone(self);
        Arc::new(move |hint| advertiser.current(hint))
    }
}
