//! OpenAI-compatible adapter over the shared engine
//!
//! Streamed responses are SSE chunks (`data: {...}\n\n`, closed by
//! `data: [DONE]\n\n`) grouped into batches by the configured batch policy.
//! With raw output each batch is the concatenated SSE text; otherwise it is
//! an array of chunk objects and the `[DONE]` marker is dropped.

use std::sync::Arc;

use futures::{stream, StreamExt};
use llmrelay_common::{RelayError, Result, METRICS};
use llmrelay_host::BatchStream;
use llmrelay_proto::OutputBatch;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::openai::{
    ChatChoice, ChatStreamChoice, ChatStreamDelta, Completion, CompletionChoice,
    CompletionStreamChoice, ModelList, ResponseMessage, StreamChunk, Usage,
};
use super::{failed, Batcher, Facade};
use crate::batching::BatchPolicy;
use crate::engine::{EngineStream, GenerationOutput, GenerationRequest, InferenceEngine, Prompt};
use crate::input::{OpenAiRequest, OpenAiRoute, RequestDescriptor, RequestParams};

/// Entry point for OpenAI-shaped requests
pub struct CompatibleFacade {
    engine: Arc<dyn InferenceEngine>,
    policy: BatchPolicy,
    raw_output: bool,
}

impl CompatibleFacade {
    pub fn new(engine: Arc<dyn InferenceEngine>, policy: BatchPolicy, raw_output: bool) -> Self {
        Self {
            engine,
            policy,
            raw_output,
        }
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    fn models(&self) -> BatchStream {
        let list = ModelList::single(self.engine.model_name());
        let batch = serde_json::to_value(&list)
            .map(OutputBatch::new)
            .map_err(RelayError::from);
        Box::pin(stream::once(async move { batch }))
    }
}

impl Facade for CompatibleFacade {
    fn generate(&self, descriptor: RequestDescriptor) -> BatchStream {
        let params = match descriptor.params {
            RequestParams::Compatible(params) => params,
            RequestParams::Native(_) => {
                return failed(RelayError::internal(
                    "compatible facade received a native request",
                ))
            }
        };

        METRICS.engine.compatible_requests.inc();
        debug!("Compatible request {} -> {}", descriptor.request_id, params.route.path());

        let kind = match params.route {
            OpenAiRoute::Models => return self.models(),
            OpenAiRoute::ChatCompletions => ResponseKind::Chat,
            OpenAiRoute::Completions => ResponseKind::Text,
        };

        let OpenAiRequest {
            model,
            messages,
            prompt,
            stream,
            mut sampling,
        } = params.request;

        let include_usage = sampling
            .extra
            .remove("stream_options")
            .and_then(|options| options.get("include_usage").and_then(Value::as_bool))
            .unwrap_or(false);

        let prompt = match kind {
            ResponseKind::Chat => Prompt::Messages(messages.unwrap_or_default()),
            ResponseKind::Text => Prompt::Text(prompt.unwrap_or_default()),
        };

        let formatter = ChunkFormatter {
            kind,
            id: format!("{}-{}", kind.id_prefix(), descriptor.request_id),
            created: chrono::Utc::now().timestamp(),
            model: model.unwrap_or_else(|| self.engine.model_name().to_string()),
            include_usage,
            choices: ChoiceState::new(sampling.choices()),
        };

        let outputs = self.engine.generate(GenerationRequest {
            request_id: descriptor.request_id,
            prompt,
            sampling,
        });

        if stream {
            sse_batches(outputs, formatter, self.policy, self.raw_output)
        } else {
            full_response(outputs, formatter)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    Chat,
    Text,
}

impl ResponseKind {
    fn id_prefix(self) -> &'static str {
        match self {
            ResponseKind::Chat => "chatcmpl",
            ResponseKind::Text => "cmpl",
        }
    }

    fn chunk_object(self) -> &'static str {
        match self {
            ResponseKind::Chat => "chat.completion.chunk",
            ResponseKind::Text => "text_completion",
        }
    }

    fn object(self) -> &'static str {
        match self {
            ResponseKind::Chat => "chat.completion",
            ResponseKind::Text => "text_completion",
        }
    }
}

/// New text for one choice in one engine step
#[derive(Debug, Clone, PartialEq)]
struct Advance {
    index: usize,
    delta: String,
    finish_reason: Option<String>,
}

/// Cumulative text, finish reasons and token counts across a request
#[derive(Debug, Default)]
struct ChoiceState {
    texts: Vec<String>,
    finish_reasons: Vec<Option<String>>,
    prompt_tokens: usize,
    generated: usize,
    reported: Option<usize>,
}

impl ChoiceState {
    fn new(choices: usize) -> Self {
        Self {
            texts: vec![String::new(); choices],
            finish_reasons: vec![None; choices],
            ..Default::default()
        }
    }

    fn advance(&mut self, output: GenerationOutput) -> Vec<Advance> {
        if let Some(prompt_tokens) = output.prompt_tokens {
            self.prompt_tokens = prompt_tokens;
        }
        if output.completion_tokens.is_some() {
            self.reported = output.completion_tokens;
        }

        let mut advances = Vec::new();
        for choice in output.outputs {
            if self.texts.len() <= choice.index {
                self.texts.resize(choice.index + 1, String::new());
                self.finish_reasons.resize(choice.index + 1, None);
            }

            let previous = &self.texts[choice.index];
            let delta = choice.text.get(previous.len()..).unwrap_or("").to_string();
            if delta.is_empty() && choice.finish_reason.is_none() {
                continue;
            }
            if !delta.is_empty() {
                self.generated += 1;
            }

            self.texts[choice.index] = choice.text;
            self.finish_reasons[choice.index] = choice.finish_reason.clone();
            advances.push(Advance {
                index: choice.index,
                delta,
                finish_reason: choice.finish_reason,
            });
        }
        advances
    }

    fn usage(&self) -> Usage {
        Usage::new(self.prompt_tokens, self.reported.unwrap_or(self.generated))
    }
}

/// Renders engine progress as OpenAI objects
#[derive(Debug)]
struct ChunkFormatter {
    kind: ResponseKind,
    id: String,
    created: i64,
    model: String,
    include_usage: bool,
    choices: ChoiceState,
}

impl ChunkFormatter {
    fn chunk<C: Serialize>(&self, choices: Vec<C>, usage: Option<Usage>) -> Result<Value> {
        let chunk = StreamChunk {
            id: self.id.clone(),
            object: self.kind.chunk_object(),
            created: self.created,
            model: self.model.clone(),
            choices,
            usage,
        };
        Ok(serde_json::to_value(&chunk)?)
    }

    /// Chunks sent before any text: the assistant role for chat responses
    fn opening(&self) -> Result<Vec<Value>> {
        match self.kind {
            ResponseKind::Text => Ok(Vec::new()),
            ResponseKind::Chat => {
                let choices = (0..self.choices.texts.len())
                    .map(|index| ChatStreamChoice {
                        index,
                        delta: ChatStreamDelta {
                            role: Some("assistant".to_string()),
                            content: None,
                        },
                        finish_reason: None,
                    })
                    .collect();
                Ok(vec![self.chunk::<ChatStreamChoice>(choices, None)?])
            }
        }
    }

    /// Chunks for one engine step
    fn step(&mut self, output: GenerationOutput) -> Result<Vec<Value>> {
        let usage_only = output.outputs.is_empty() && output.completion_tokens.is_some();
        let advances = self.choices.advance(output);

        let mut chunks = Vec::new();
        if !advances.is_empty() {
            let chunk = match self.kind {
                ResponseKind::Chat => self.chunk(
                    advances
                        .into_iter()
                        .map(|advance| ChatStreamChoice {
                            index: advance.index,
                            delta: ChatStreamDelta {
                                role: None,
                                content: (!advance.delta.is_empty()).then_some(advance.delta),
                            },
                            finish_reason: advance.finish_reason,
                        })
                        .collect(),
                    None,
                )?,
                ResponseKind::Text => self.chunk(
                    advances
                        .into_iter()
                        .map(|advance| CompletionStreamChoice {
                            index: advance.index,
                            text: advance.delta,
                            finish_reason: advance.finish_reason,
                        })
                        .collect(),
                    None,
                )?,
            };
            chunks.push(chunk);
        }

        if usage_only && self.include_usage {
            chunks.push(self.chunk::<CompletionStreamChoice>(Vec::new(), Some(self.choices.usage()))?);
        }
        Ok(chunks)
    }

    /// The whole response as one object
    fn completion(self) -> Result<Value> {
        let usage = self.choices.usage();
        let choices = self
            .choices
            .texts
            .into_iter()
            .zip(self.choices.finish_reasons)
            .enumerate();

        let value = match self.kind {
            ResponseKind::Chat => serde_json::to_value(Completion {
                id: self.id,
                object: self.kind.object(),
                created: self.created,
                model: self.model,
                choices: choices
                    .map(|(index, (text, finish_reason))| ChatChoice {
                        index,
                        message: ResponseMessage {
                            role: "assistant".to_string(),
                            content: text,
                        },
                        finish_reason,
                    })
                    .collect(),
                usage,
            })?,
            ResponseKind::Text => serde_json::to_value(Completion {
                id: self.id,
                object: self.kind.object(),
                created: self.created,
                model: self.model,
                choices: choices
                    .map(|(index, (text, finish_reason))| CompletionChoice {
                        index,
                        text,
                        finish_reason,
                    })
                    .collect(),
                usage,
            })?,
        };
        Ok(value)
    }
}

#[derive(Debug)]
enum SseEvent {
    Chunk(Value),
    Done,
}

fn render(events: Vec<SseEvent>, raw_output: bool) -> OutputBatch {
    if raw_output {
        let text: String = events
            .iter()
            .map(|event| match event {
                SseEvent::Chunk(chunk) => format!("data: {}\n\n", chunk),
                SseEvent::Done => "data: [DONE]\n\n".to_string(),
            })
            .collect();
        OutputBatch::new(Value::String(text))
    } else {
        let chunks = events
            .into_iter()
            .filter_map(|event| match event {
                SseEvent::Chunk(chunk) => Some(chunk),
                SseEvent::Done => None,
            })
            .collect();
        OutputBatch::new(Value::Array(chunks))
    }
}

fn sse_batches(
    outputs: EngineStream,
    formatter: ChunkFormatter,
    policy: BatchPolicy,
    raw_output: bool,
) -> BatchStream {
    Box::pin(async_stream::stream! {
        let mut outputs = outputs;
        let mut formatter = formatter;
        let mut batcher = Batcher::new(policy);

        let opening = match formatter.opening() {
            Ok(chunks) => chunks,
            Err(e) => {
                yield Err(e);
                return;
            }
        };
        for chunk in opening {
            if let Some(full) = batcher.push(SseEvent::Chunk(chunk)) {
                yield Ok(render(full, raw_output));
            }
        }

        while let Some(item) = outputs.next().await {
            let chunks = match item.and_then(|output| formatter.step(output)) {
                Ok(chunks) => chunks,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for chunk in chunks {
                if let Some(full) = batcher.push(SseEvent::Chunk(chunk)) {
                    yield Ok(render(full, raw_output));
                }
            }
        }

        if raw_output {
            if let Some(full) = batcher.push(SseEvent::Done) {
                yield Ok(render(full, raw_output));
            }
        }
        if let Some(rest) = batcher.flush() {
            yield Ok(render(rest, raw_output));
        }
    })
}

fn full_response(outputs: EngineStream, formatter: ChunkFormatter) -> BatchStream {
    Box::pin(async_stream::stream! {
        let mut outputs = outputs;
        let mut formatter = formatter;

        while let Some(item) = outputs.next().await {
            match item {
                Ok(output) => {
                    formatter.choices.advance(output);
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        yield formatter.completion().map(OutputBatch::new);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngine;
    use futures::TryStreamExt;
    use serde_json::json;

    fn static_policy(size: usize) -> BatchPolicy {
        BatchPolicy {
            max_batch_size: size,
            min_batch_size: size,
            growth_factor: 1.0,
        }
    }

    async fn run(
        engine: MockEngine,
        input: Value,
        policy: BatchPolicy,
        raw_output: bool,
    ) -> (Arc<MockEngine>, Vec<Value>) {
        let engine = Arc::new(engine);
        let facade = CompatibleFacade::new(engine.clone(), policy, raw_output);
        let descriptor = RequestDescriptor::from_input(&input, &policy).unwrap();
        let batches = facade
            .generate(descriptor)
            .map_ok(OutputBatch::into_inner)
            .try_collect()
            .await
            .unwrap();
        (engine, batches)
    }

    #[tokio::test]
    async fn test_models_route() {
        let (engine, batches) = run(
            MockEngine::new(),
            json!({"openai_route": "/v1/models"}),
            BatchPolicy::default(),
            true,
        )
        .await;

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0]["object"], "list");
        assert_eq!(batches[0]["data"][0]["id"], "mock-model");
        assert!(engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_chat_completion_non_stream() {
        let (engine, batches) = run(
            MockEngine::new().with_text_deltas(&["Hi", " there"]),
            json!({
                "openai_route": "/v1/chat/completions",
                "openai_input": {
                    "messages": [{"role": "user", "content": "hello"}],
                    "max_tokens": 8
                }
            }),
            BatchPolicy::default(),
            true,
        )
        .await;

        assert_eq!(batches.len(), 1);
        let response = &batches[0];
        assert_eq!(response["object"], "chat.completion");
        assert_eq!(response["model"], "mock-model");
        assert_eq!(response["choices"][0]["message"]["content"], "Hi there");
        assert_eq!(response["choices"][0]["finish_reason"], "stop");
        assert_eq!(response["usage"], json!({"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}));

        let request = &engine.requests()[0];
        assert!(matches!(request.prompt, Prompt::Messages(ref m) if m.len() == 1));
        assert_eq!(request.sampling.max_tokens, Some(8));
    }

    #[tokio::test]
    async fn test_raw_stream_batches_are_sse_text() {
        let (_, batches) = run(
            MockEngine::new().with_text_deltas(&["a", "b"]),
            json!({"openai_route": "/v1/completions", "openai_input": {"prompt": "x", "stream": true}}),
            static_policy(2),
            true,
        )
        .await;

        // Two text chunks plus [DONE]
        assert_eq!(batches.len(), 2);
        let first = batches[0].as_str().unwrap();
        assert_eq!(first.matches("data: ").count(), 2);
        assert!(first.contains("\"text\":\"a\""));
        assert_eq!(batches[1].as_str().unwrap(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_parsed_stream_skips_done() {
        let (_, batches) = run(
            MockEngine::new().with_text_deltas(&["a", "b"]),
            json!({
                "openai_route": true,
                "openai_input": {
                    "messages": [{"role": "user", "content": "x"}],
                    "stream": true,
                    "stream_options": {"include_usage": true}
                }
            }),
            static_policy(50),
            false,
        )
        .await;

        assert_eq!(batches.len(), 1);
        let chunks = batches[0].as_array().unwrap();
        // role, "a", "b" (with finish_reason), usage
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "a");
        assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunks[3]["usage"]["completion_tokens"], 2);
        assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
    }

    #[tokio::test]
    async fn test_engine_error_propagates() {
        let engine = Arc::new(MockEngine::new().failing("EngineDeadError", "gone"));
        let facade = CompatibleFacade::new(engine, BatchPolicy::default(), true);
        let descriptor = RequestDescriptor::from_input(
            &json!({"openai_route": true, "prompt": "x", "stream": true}),
            &BatchPolicy::default(),
        )
        .unwrap();

        let items: Vec<_> = facade.generate(descriptor).collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().kind_name(), "EngineDeadError");
    }
}
