//! Inference engine surface
//!
//! The engine (scheduling, batching, KV cache) lives outside this crate. The
//! worker only needs to start a generation, read the engine's concurrency
//! policy and learn the served model name. One engine instance exists per
//! process and is shared by both facades.

mod http;
mod sse;

pub use http::HttpEngine;

use futures::stream::BoxStream;
use llmrelay_common::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Incremental engine results for one request
pub type EngineStream = BoxStream<'static, Result<GenerationOutput>>;

/// The external inference engine
pub trait InferenceEngine: Send + Sync {
    /// Start generating. The returned stream is lazy: nothing is produced
    /// until it is polled, and dropping it abandons the request.
    fn generate(&self, request: GenerationRequest) -> EngineStream;

    /// Maximum number of requests the engine currently accepts at once
    fn max_concurrency(&self) -> usize;

    /// Name of the served model
    fn model_name(&self) -> &str;
}

/// One chat turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,

    /// Plain text or an array of content parts, passed through untouched
    pub content: Value,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Value::String(content.into()),
        }
    }
}

/// What the engine should continue
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Text(String),
    Messages(Vec<ChatMessage>),
}

/// Sampling parameters.
///
/// Only the fields the worker reads are typed; everything else is kept in
/// `extra` and handed to the engine as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Number of completions per prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SamplingParams {
    /// Number of choices, at least one
    pub fn choices(&self) -> usize {
        self.n.unwrap_or(1).max(1)
    }
}

/// A request as the engine receives it
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub request_id: String,
    pub prompt: Prompt,
    pub sampling: SamplingParams,
}

/// Progress of one choice. `text` is cumulative, not a delta.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutput {
    pub index: usize,
    pub text: String,
    pub finish_reason: Option<String>,
}

/// One step of engine output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutput {
    /// Prompt length in tokens, when the engine reports it
    pub prompt_tokens: Option<usize>,

    /// Generated tokens so far, when the engine reports it
    pub completion_tokens: Option<usize>,

    /// Choices that advanced in this step
    pub outputs: Vec<CompletionOutput>,
}
