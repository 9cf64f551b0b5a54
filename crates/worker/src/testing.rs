//! Test doubles shared by the worker's unit tests

use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream;
use llmrelay_common::{RelayError, Result};
use parking_lot::Mutex;

use crate::engine::{
    CompletionOutput, EngineStream, GenerationOutput, GenerationRequest, InferenceEngine,
};
use crate::liveness::Terminator;

#[derive(Debug, Clone)]
enum Step {
    Output(GenerationOutput),
    Fail { kind: String, message: String },
}

/// Engine that replays the same script for every request
pub(crate) struct MockEngine {
    steps: Vec<Step>,
    requests: Mutex<Vec<GenerationRequest>>,
    max_concurrency: AtomicUsize,
    model: String,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self {
            steps: Vec::new(),
            requests: Mutex::new(Vec::new()),
            max_concurrency: AtomicUsize::new(4),
            model: "mock-model".to_string(),
        }
    }

    /// Script one choice growing by `deltas`, finishing with `stop`, followed
    /// by a usage-only step
    pub(crate) fn with_text_deltas(mut self, deltas: &[&str]) -> Self {
        let mut text = String::new();
        for (i, delta) in deltas.iter().enumerate() {
            text.push_str(delta);
            let finish = (i + 1 == deltas.len()).then_some("stop");
            self.steps.push(Step::Output(GenerationOutput {
                prompt_tokens: Some(3),
                completion_tokens: None,
                outputs: vec![output(0, &text, finish)],
            }));
        }
        self.steps.push(Step::Output(GenerationOutput {
            prompt_tokens: Some(3),
            completion_tokens: Some(deltas.len()),
            outputs: Vec::new(),
        }));
        self
    }

    pub(crate) fn with_output(mut self, output: GenerationOutput) -> Self {
        self.steps.push(Step::Output(output));
        self
    }

    /// Fail with an engine error after the scripted outputs
    pub(crate) fn failing(mut self, kind: &str, message: &str) -> Self {
        self.steps.push(Step::Fail {
            kind: kind.to_string(),
            message: message.to_string(),
        });
        self
    }

    pub(crate) fn set_max_concurrency(&self, n: usize) {
        self.max_concurrency.store(n, Ordering::SeqCst);
    }

    pub(crate) fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

impl InferenceEngine for MockEngine {
    fn generate(&self, request: GenerationRequest) -> EngineStream {
        self.requests.lock().push(request);

        let items: Vec<Result<GenerationOutput>> = self
            .steps
            .iter()
            .cloned()
            .map(|step| match step {
                Step::Output(output) => Ok(output),
                Step::Fail { kind, message } => Err(RelayError::engine(kind, message)),
            })
            .collect();
        Box::pin(stream::iter(items))
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency.load(Ordering::SeqCst)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

pub(crate) fn output(index: usize, text: &str, finish: Option<&str>) -> CompletionOutput {
    CompletionOutput {
        index,
        text: text.to_string(),
        finish_reason: finish.map(str::to_string),
    }
}

/// Terminator that records exit codes instead of exiting
#[derive(Default)]
pub(crate) struct RecordingTerminator {
    codes: Mutex<Vec<i32>>,
}

impl RecordingTerminator {
    pub(crate) fn codes(&self) -> Vec<i32> {
        self.codes.lock().clone()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, code: i32) {
        self.codes.lock().push(code);
    }
}
