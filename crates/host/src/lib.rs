//! llmrelay job host
//!
//! A minimal local job-queue surface. The worker hands over a job handler,
//! a concurrency hook and the aggregate-stream flag; the host accepts jobs
//! over HTTP, drives the handler and reports each job's outcome.

pub mod handlers;
pub mod server;

use futures::stream::BoxStream;
use llmrelay_common::Result;
use llmrelay_proto::{Job, OutputBatch};
use std::sync::Arc;

pub use server::{router, start, HostState};

/// Lazy sequence of output batches produced for one job
pub type BatchStream = BoxStream<'static, Result<OutputBatch>>;

/// Concurrency hook: given the current in-flight count, return how many
/// jobs the worker accepts at once.
pub type ConcurrencyModifier = Arc<dyn Fn(usize) -> usize + Send + Sync>;

/// Per-job entry point invoked by the host
pub trait JobHandler: Send + Sync + 'static {
    /// Start handling a job. Errors surface as the final stream item.
    fn handle(&self, job: Job) -> BatchStream;
}

/// Everything the worker tells the host at start-up
#[derive(Clone)]
pub struct ServerlessOptions {
    pub handler: Arc<dyn JobHandler>,
    pub concurrency_modifier: ConcurrencyModifier,

    /// Batches form one aggregate stream; `/runsync` returns them all
    pub return_aggregate_stream: bool,

    /// Serve `/metrics`
    pub enable_metrics: bool,
}

impl ServerlessOptions {
    pub fn new(handler: Arc<dyn JobHandler>, concurrency_modifier: ConcurrencyModifier) -> Self {
        Self {
            handler,
            concurrency_modifier,
            return_aggregate_stream: true,
            enable_metrics: true,
        }
    }

    pub fn with_aggregate_stream(mut self, enabled: bool) -> Self {
        self.return_aggregate_stream = enabled;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }
}
