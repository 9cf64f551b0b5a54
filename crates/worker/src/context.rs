//! Process-wide worker state
//!
//! Built once before the host accepts jobs and shared by every job through an
//! `Arc`. The engine inside is never replaced.

use std::sync::Arc;

use llmrelay_common::{RelayConfig, Result};
use llmrelay_host::ServerlessOptions;
use tracing::info;

use crate::batching::BatchPolicy;
use crate::concurrency::ConcurrencyAdvertiser;
use crate::engine::{HttpEngine, InferenceEngine};
use crate::facade::EngineFacades;
use crate::handler::WorkerHandler;
use crate::liveness::{FatalMarkers, LivenessMonitor, Terminator};

pub struct WorkerContext {
    pub engine: Arc<dyn InferenceEngine>,
    pub facades: EngineFacades,
    pub monitor: Arc<LivenessMonitor>,
    pub concurrency: Arc<ConcurrencyAdvertiser>,

    /// Batch policy for jobs that do not set their own
    pub batch_policy: BatchPolicy,

    return_aggregate_stream: bool,
    enable_metrics: bool,
}

impl WorkerContext {
    /// Wire an existing engine into facades, monitor and advertiser
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        config: &RelayConfig,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        let batch_policy = BatchPolicy::from_config(&config.batching);
        let facades = EngineFacades::new(Arc::clone(&engine), batch_policy, config.openai.raw_output);
        let monitor = Arc::new(LivenessMonitor::new(
            FatalMarkers::with_extra(&config.liveness),
            terminator,
        ));
        let concurrency = Arc::new(ConcurrencyAdvertiser::new(Arc::clone(&engine)));

        Self {
            engine,
            facades,
            monitor,
            concurrency,
            batch_policy,
            return_aggregate_stream: config.host.return_aggregate_stream,
            enable_metrics: config
                .observability
                .as_ref()
                .map_or(true, |o| o.enable_metrics),
        }
    }

    /// Connect to the configured engine and build the context
    pub async fn build(config: &RelayConfig, terminator: Arc<dyn Terminator>) -> Result<Self> {
        let engine = HttpEngine::connect(config).await?;
        info!(
            "Engine {} accepts {} concurrent requests",
            engine.model_name(),
            engine.max_concurrency()
        );
        Ok(Self::new(Arc::new(engine), config, terminator))
    }

    /// Handler, concurrency hook and flags for the host
    pub fn serverless_options(self: &Arc<Self>) -> ServerlessOptions {
        ServerlessOptions::new(
            Arc::new(WorkerHandler::new(Arc::clone(self))),
            self.concurrency.modifier(),
        )
        .with_aggregate_stream(self.return_aggregate_stream)
        .with_metrics(self.enable_metrics)
    }
}
