//! Native job format
//!
//! Batches look like
//! `{"choices": [{"tokens": ["Hel", "lo"]}], "usage": {"input": 3, "output": 2}}`
//! with one entry in `choices` per requested completion, in index order.
//! Streaming requests get text deltas grouped by the request's batch policy;
//! other requests get a single batch holding each choice's final text.

use std::sync::Arc;

use futures::StreamExt;
use llmrelay_common::{RelayError, METRICS};
use llmrelay_host::BatchStream;
use llmrelay_proto::OutputBatch;
use serde_json::json;
use tracing::debug;

use super::{failed, Batcher, Facade};
use crate::batching::BatchPolicy;
use crate::engine::{EngineStream, GenerationOutput, GenerationRequest, InferenceEngine};
use crate::input::{RequestDescriptor, RequestParams};

/// Entry point for the native job format
pub struct NativeFacade {
    engine: Arc<dyn InferenceEngine>,
}

impl NativeFacade {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }
}

impl Facade for NativeFacade {
    fn generate(&self, descriptor: RequestDescriptor) -> BatchStream {
        let params = match descriptor.params {
            RequestParams::Native(params) => params,
            RequestParams::Compatible(_) => {
                return failed(RelayError::internal(
                    "native facade received an OpenAI request",
                ))
            }
        };

        METRICS.engine.native_requests.inc();

        let choices = params.sampling.choices();
        let request = GenerationRequest {
            request_id: descriptor.request_id,
            prompt: params.prompt,
            sampling: params.sampling,
        };
        debug!(
            "Native request {} (stream={}, n={})",
            request.request_id, params.stream, choices
        );

        let outputs = self.engine.generate(request);
        if params.stream {
            stream_batches(outputs, choices, params.batch_policy)
        } else {
            single_batch(outputs, choices)
        }
    }
}

/// Running token counts for the `usage` field
#[derive(Debug, Default)]
struct Usage {
    input: usize,
    generated: usize,
    reported: Option<usize>,
}

impl Usage {
    fn observe(&mut self, output: &GenerationOutput) {
        if let Some(prompt_tokens) = output.prompt_tokens {
            self.input = prompt_tokens;
        }
        if output.completion_tokens.is_some() {
            self.reported = output.completion_tokens;
        }
    }

    /// Engine-reported count once known, otherwise one per delta
    fn output(&self) -> usize {
        self.reported.unwrap_or(self.generated)
    }
}

/// Tracks how much of each choice's cumulative text was already sent
#[derive(Debug)]
struct Deltas {
    sent: Vec<usize>,
}

impl Deltas {
    fn new(choices: usize) -> Self {
        Self {
            sent: vec![0; choices],
        }
    }

    fn next<'a>(&mut self, index: usize, text: &'a str) -> Option<&'a str> {
        if self.sent.len() <= index {
            self.sent.resize(index + 1, 0);
        }
        let delta = text.get(self.sent[index]..).unwrap_or("");
        if delta.is_empty() {
            return None;
        }
        self.sent[index] = text.len();
        Some(delta)
    }

    fn choices(&self) -> usize {
        self.sent.len()
    }
}

fn native_batch(tokens: Vec<Vec<String>>, usage: &Usage) -> OutputBatch {
    let choices: Vec<_> = tokens
        .into_iter()
        .map(|tokens| json!({ "tokens": tokens }))
        .collect();

    OutputBatch::new(json!({
        "choices": choices,
        "usage": {"input": usage.input, "output": usage.output()},
    }))
}

/// Spread `(index, delta)` pairs over one token list per choice
fn group_tokens(items: Vec<(usize, String)>, choices: usize) -> Vec<Vec<String>> {
    let mut tokens = vec![Vec::new(); choices];
    for (index, delta) in items {
        tokens[index].push(delta);
    }
    tokens
}

fn stream_batches(outputs: EngineStream, choices: usize, policy: BatchPolicy) -> BatchStream {
    Box::pin(async_stream::stream! {
        let mut outputs = outputs;
        let mut deltas = Deltas::new(choices);
        let mut batcher = Batcher::new(policy);
        let mut usage = Usage::default();

        while let Some(item) = outputs.next().await {
            let output = match item {
                Ok(output) => output,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            usage.observe(&output);

            for choice in &output.outputs {
                let Some(delta) = deltas.next(choice.index, &choice.text) else {
                    continue;
                };
                usage.generated += 1;

                if let Some(full) = batcher.push((choice.index, delta.to_string())) {
                    yield Ok(native_batch(group_tokens(full, deltas.choices()), &usage));
                }
            }
        }

        if let Some(rest) = batcher.flush() {
            yield Ok(native_batch(group_tokens(rest, deltas.choices()), &usage));
        }
    })
}

fn single_batch(outputs: EngineStream, choices: usize) -> BatchStream {
    Box::pin(async_stream::stream! {
        let mut outputs = outputs;
        let mut texts = vec![String::new(); choices];
        let mut usage = Usage::default();

        while let Some(item) = outputs.next().await {
            let output = match item {
                Ok(output) => output,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            usage.observe(&output);

            for choice in output.outputs {
                if texts.len() <= choice.index {
                    texts.resize(choice.index + 1, String::new());
                }
                if choice.text.len() > texts[choice.index].len() {
                    usage.generated += 1;
                }
                texts[choice.index] = choice.text;
            }
        }

        let tokens = texts.into_iter().map(|text| vec![text]).collect();
        yield Ok(native_batch(tokens, &usage));
    })
}
