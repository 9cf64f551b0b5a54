//! Per-job entry point
//!
//! The one place job errors are caught. Validation failures and anything the
//! relay forwards go through the liveness monitor, which either hands the
//! error back to the host or ends the process.

use std::sync::Arc;

use futures::StreamExt;
use llmrelay_common::{RelayError, METRICS};
use llmrelay_host::{BatchStream, JobHandler};
use llmrelay_proto::Job;
use tracing::{debug, info};

use crate::context::WorkerContext;
use crate::input::RequestDescriptor;
use crate::liveness::Verdict;
use crate::relay::relay;

pub struct WorkerHandler {
    context: Arc<WorkerContext>,
}

impl WorkerHandler {
    pub fn new(context: Arc<WorkerContext>) -> Self {
        Self { context }
    }
}

impl JobHandler for WorkerHandler {
    fn handle(&self, job: Job) -> BatchStream {
        let context = Arc::clone(&self.context);

        Box::pin(async_stream::stream! {
            let _job = context.monitor.begin_job();
            let _timer = METRICS.jobs.job_duration.start_timer();
            METRICS.jobs.jobs_total.inc();

            let descriptor = match RequestDescriptor::from_input(&job.input, &context.batch_policy) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    METRICS.jobs.validation_failures.inc();
                    if let Some(e) = surface(&context, &job.id, e) {
                        yield Err(e);
                    }
                    return;
                }
            };
            debug!(job_id = %job.id, request_id = %descriptor.request_id, route = ?descriptor.route(), "Job accepted");

            let facade = context.facades.select(&descriptor);
            let mut batches = relay(facade.generate(descriptor));
            let mut emitted = 0usize;

            while let Some(item) = batches.next().await {
                match item {
                    Ok(batch) => {
                        emitted += 1;
                        METRICS.jobs.batches_emitted.inc();
                        yield Ok(batch);
                    }
                    Err(e) => {
                        if let Some(e) = surface(&context, &job.id, e) {
                            yield Err(e);
                        }
                        return;
                    }
                }
            }

            METRICS.jobs.jobs_completed.inc();
            info!(job_id = %job.id, batches = emitted, "Job completed");
        })
    }
}

/// Run an error past the monitor; `None` when the worker is terminating
fn surface(context: &WorkerContext, job_id: &str, err: RelayError) -> Option<RelayError> {
    match context.monitor.inspect(err) {
        Verdict::Propagate(err) => {
            METRICS.jobs.jobs_failed.inc();
            debug!(job_id = %job_id, "Propagating job failure");
            Some(err)
        }
        Verdict::Terminated => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InferenceEngine;
    use crate::liveness::{WorkerState, FATAL_EXIT_CODE};
    use crate::testing::{MockEngine, RecordingTerminator};
    use llmrelay_common::RelayConfig;
    use serde_json::{json, Value};

    struct Harness {
        engine: Arc<MockEngine>,
        terminator: Arc<RecordingTerminator>,
        context: Arc<WorkerContext>,
        handler: WorkerHandler,
    }

    fn harness(engine: MockEngine) -> Harness {
        let engine = Arc::new(engine);
        let terminator = Arc::new(RecordingTerminator::default());
        let shared: Arc<dyn InferenceEngine> = engine.clone();
        let context = Arc::new(WorkerContext::new(
            shared,
            &RelayConfig::default(),
            terminator.clone(),
        ));
        let handler = WorkerHandler::new(context.clone());
        Harness {
            engine,
            terminator,
            context,
            handler,
        }
    }

    async fn run(handler: &WorkerHandler, input: Value) -> Vec<Result<Value, RelayError>> {
        handler
            .handle(Job::new("job-1", input))
            .map(|item| item.map(|batch| batch.into_inner()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_native_job_streams_batches() {
        // Default routing, three deltas, one batch each
        let h = harness(MockEngine::new().with_text_deltas(&["x", "y", "z"]));
        let items = run(
            &h.handler,
            json!({"prompt": "hi", "stream": true, "batch_size_growth_factor": 1, "max_batch_size": 1}),
        )
        .await;

        let tokens: Vec<Value> = items
            .into_iter()
            .map(|item| item.unwrap()["choices"][0]["tokens"].clone())
            .collect();
        assert_eq!(tokens, vec![json!(["x"]), json!(["y"]), json!(["z"])]);
        assert!(h.terminator.codes().is_empty());
        assert_eq!(h.engine.requests().len(), 1);
        assert_eq!(h.context.monitor.state(), WorkerState::Running);
    }

    #[tokio::test]
    async fn test_fatal_engine_error_terminates() {
        // Engine dies after the first batch
        let h = harness(
            MockEngine::new()
                .with_text_deltas(&["x"])
                .failing("RuntimeError", "EngineCore encountered an issue. See stack trace."),
        );
        let items = run(
            &h.handler,
            json!({"prompt": "hi", "stream": true, "batch_size_growth_factor": 1, "max_batch_size": 1}),
        )
        .await;

        assert_eq!(h.terminator.codes(), vec![FATAL_EXIT_CODE]);
        assert!(items.iter().all(|item| item.is_ok()));
        assert_eq!(items.len(), 1);
        assert_eq!(h.context.monitor.state(), WorkerState::Terminating);
    }

    #[tokio::test]
    async fn test_fatal_kind_on_compatible_route() {
        let h = harness(MockEngine::new().failing("EngineDeadError", "background loop stopped"));
        let items = run(
            &h.handler,
            json!({"openai_route": true, "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;

        assert!(items.is_empty());
        assert_eq!(h.terminator.codes(), vec![FATAL_EXIT_CODE]);
    }

    #[tokio::test]
    async fn test_validation_error_propagates() {
        // Missing prompt fails the job and leaves the worker up
        let h = harness(MockEngine::new().with_text_deltas(&["x"]));
        let items = run(&h.handler, json!({"stream": true})).await;

        assert_eq!(items.len(), 1);
        let err = items[0].as_ref().unwrap_err();
        assert_eq!(err.kind_name(), "ValidationError");
        assert!(h.terminator.codes().is_empty());
        assert!(h.engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_non_fatal_engine_error_is_unchanged() {
        let h = harness(MockEngine::new().failing("UpstreamError", "engine returned HTTP 503"));
        let items = run(&h.handler, json!({"prompt": "hi"})).await;

        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(RelayError::Engine { kind, message }) => {
                assert_eq!(kind, "UpstreamError");
                assert_eq!(message, "engine returned HTTP 503");
            }
            other => panic!("unexpected item {:?}", other),
        }
        assert!(h.terminator.codes().is_empty());
    }

    #[tokio::test]
    async fn test_worker_keeps_serving_after_failure() {
        let h = harness(MockEngine::new().with_text_deltas(&["ok"]));

        let failed = run(&h.handler, json!({})).await;
        assert!(failed[0].is_err());

        let served = run(&h.handler, json!({"prompt": "again"})).await;
        assert_eq!(served.len(), 1);
        assert_eq!(served[0].as_ref().unwrap()["choices"][0]["tokens"], json!(["ok"]));
        assert_eq!(h.context.monitor.state(), WorkerState::Running);
    }
}
