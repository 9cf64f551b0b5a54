//! HTTP inference engine
//!
//! Drives an OpenAI-compatible inference server running next to the worker
//! (for example a local vLLM process). Generations are always requested as
//! SSE streams; the deltas are folded back into cumulative per-choice text.

use std::time::Duration;

use futures::{Stream, StreamExt};
use llmrelay_common::{RelayConfig, RelayError, Result};
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::sse::SseDecoder;
use super::{
    CompletionOutput, EngineStream, GenerationOutput, GenerationRequest, InferenceEngine, Prompt,
};

/// Kind reported for transport failures that leave the engine usable
const CONNECTION_ERROR_KIND: &str = "EngineConnectionError";

/// Kind reported when a request exceeds its deadline
const TIMEOUT_ERROR_KIND: &str = "EngineTimeout";

/// Kind reported once the engine stops accepting connections or answers
/// server errors with nothing in the body. Covered by the fatal kind markers.
const DEAD_ENGINE_KIND: &str = "EngineDeadError";

/// Kind reported when the engine's error body names no type
const UPSTREAM_ERROR_KIND: &str = "UpstreamError";

/// Engine reached over HTTP
pub struct HttpEngine {
    client: Client,
    base_url: String,
    model: String,
    max_concurrency: usize,
    request_timeout: Option<Duration>,
}

impl HttpEngine {
    /// Create an engine handle without contacting the server
    pub fn new(base_url: &str, model: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            max_concurrency,
            request_timeout: None,
        }
    }

    /// Wait for the engine to come up and learn the served model.
    ///
    /// Probes `GET /v1/models` up to `engine.startup_retries` times. A
    /// configured model name wins over the discovered one.
    pub async fn connect(config: &RelayConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| RelayError::startup(format!("Failed to build HTTP client: {}", e)))?;
        let base_url = config.engine.base_url.trim_end_matches('/').to_string();
        let attempts = config.engine.startup_retries.max(1);

        let mut last_error = None;
        for attempt in 1..=attempts {
            match probe_models(&client, &base_url).await {
                Ok(served) => {
                    let model = match (&config.engine.model, served) {
                        (Some(configured), _) => configured.clone(),
                        (None, Some(served)) => served,
                        (None, None) => {
                            return Err(RelayError::startup(format!(
                                "Engine at {} serves no models",
                                base_url
                            )))
                        }
                    };

                    info!("Engine ready at {} serving {}", base_url, model);
                    return Ok(Self {
                        client,
                        base_url,
                        model,
                        max_concurrency: config.engine.max_concurrency,
                        request_timeout: config.request_timeout(),
                    });
                }
                Err(e) => {
                    debug!("Engine probe {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(config.startup_retry_interval()).await;
                    }
                }
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(RelayError::startup(format!(
            "Engine at {} not ready after {} attempts: {}",
            base_url, attempts, reason
        )))
    }

    /// Endpoint and JSON body for a generation request
    fn build_request(&self, request: &GenerationRequest) -> (String, Value) {
        let sampling = &request.sampling;
        let mut body: Map<String, Value> = sampling.extra.clone();

        body.insert("model".into(), json!(self.model));
        if let Some(n) = sampling.n {
            body.insert("n".into(), json!(n));
        }
        if let Some(max_tokens) = sampling.max_tokens {
            body.insert("max_tokens".into(), json!(max_tokens));
        }
        if let Some(temperature) = sampling.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = sampling.top_p {
            body.insert("top_p".into(), json!(top_p));
        }

        let path = match &request.prompt {
            Prompt::Text(text) => {
                body.insert("prompt".into(), json!(text));
                "/v1/completions"
            }
            Prompt::Messages(messages) => {
                let messages = messages
                    .iter()
                    .map(|m| json!({"role": m.role, "content": m.content}))
                    .collect();
                body.insert("messages".into(), Value::Array(messages));
                "/v1/chat/completions"
            }
        };

        body.insert("stream".into(), Value::Bool(true));
        body.insert("stream_options".into(), json!({"include_usage": true}));

        (format!("{}{}", self.base_url, path), Value::Object(body))
    }
}

impl InferenceEngine for HttpEngine {
    fn generate(&self, request: GenerationRequest) -> EngineStream {
        let (url, body) = self.build_request(&request);
        let client = self.client.clone();
        let timeout = self.request_timeout;
        let request_id = request.request_id;

        Box::pin(async_stream::stream! {
            debug!("Request {} -> {}", request_id, url);

            let mut builder = client
                .post(&url)
                .header("x-request-id", request_id.as_str())
                .json(&body);
            if let Some(timeout) = timeout {
                builder = builder.timeout(timeout);
            }

            let response = match send(builder).await {
                Ok(response) => response,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut outputs = Box::pin(decode_stream(response.bytes_stream()));
            while let Some(item) = outputs.next().await {
                let failed = item.is_err();
                yield item;
                if failed {
                    return;
                }
            }
        })
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Send a request, turning transport failures and non-2xx answers into
/// engine errors
async fn send(builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = builder.send().await.map_err(transport_error)?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status.as_u16(), &body))
}

async fn probe_models(client: &Client, base_url: &str) -> Result<Option<String>> {
    let response = send(client.get(format!("{}/v1/models", base_url))).await?;
    let models: Value = response.json().await.map_err(transport_error)?;

    Ok(models["data"]
        .as_array()
        .and_then(|data| data.first())
        .and_then(|model| model["id"].as_str())
        .map(str::to_string))
}

/// Decode an SSE byte stream into generation outputs
fn decode_stream<S, E>(bytes: S) -> impl Stream<Item = Result<GenerationOutput>>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + 'static,
    E: Into<reqwest::Error> + Send + 'static,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::new();
        let mut choices = ChoiceAccumulator::default();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(transport_error(e.into()));
                    return;
                }
            };

            for data in decoder.push(&chunk) {
                if data == "[DONE]" {
                    return;
                }
                match choices.apply_payload(&data) {
                    Ok(Some(output)) => yield Ok(output),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if let Some(data) = decoder.finish() {
            if data != "[DONE]" {
                match choices.apply_payload(&data) {
                    Ok(Some(output)) => yield Ok(output),
                    Ok(None) => {}
                    Err(e) => yield Err(e),
                }
            }
        }
    }
}

/// Folds streamed deltas into cumulative text per choice
#[derive(Debug, Default)]
struct ChoiceAccumulator {
    texts: Vec<String>,
}

impl ChoiceAccumulator {
    fn apply_payload(&mut self, data: &str) -> Result<Option<GenerationOutput>> {
        let chunk: Value = serde_json::from_str(data)?;
        self.apply(&chunk)
    }

    fn apply(&mut self, chunk: &Value) -> Result<Option<GenerationOutput>> {
        if let Some(error) = stream_error(chunk) {
            return Err(error);
        }

        let mut output = GenerationOutput::default();

        if let Some(usage) = chunk.get("usage").filter(|usage| usage.is_object()) {
            output.prompt_tokens = usage["prompt_tokens"].as_u64().map(|n| n as usize);
            output.completion_tokens = usage["completion_tokens"].as_u64().map(|n| n as usize);
        }

        for choice in chunk["choices"].as_array().into_iter().flatten() {
            let index = choice["index"].as_u64().unwrap_or(0) as usize;
            let delta = choice
                .pointer("/delta/content")
                .and_then(Value::as_str)
                .or_else(|| choice["text"].as_str())
                .unwrap_or("");
            let finish_reason = choice["finish_reason"].as_str().map(str::to_string);

            // Role-only chunks carry nothing
            if delta.is_empty() && finish_reason.is_none() {
                continue;
            }

            if self.texts.len() <= index {
                self.texts.resize(index + 1, String::new());
            }
            self.texts[index].push_str(delta);

            output.outputs.push(CompletionOutput {
                index,
                text: self.texts[index].clone(),
                finish_reason,
            });
        }

        if output.outputs.is_empty() && output.prompt_tokens.is_none() {
            return Ok(None);
        }
        Ok(Some(output))
    }
}

/// Error embedded in a streamed chunk, either `{"error": {...}}` or an
/// `{"object": "error", ...}` body
fn stream_error(chunk: &Value) -> Option<RelayError> {
    let error = match chunk.get("error") {
        Some(error) if error.is_object() => error,
        _ if chunk["object"] == "error" => chunk,
        _ => return None,
    };

    let kind = error["type"].as_str().unwrap_or(UPSTREAM_ERROR_KIND);
    let message = error["message"].as_str().unwrap_or("engine reported an error");
    Some(RelayError::engine(kind, message))
}

fn error_from_body(status: u16, body: &str) -> RelayError {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(error) = stream_error(&value) {
            return error;
        }
    }

    if status >= 500 && body.trim().is_empty() {
        return RelayError::engine(
            DEAD_ENGINE_KIND,
            format!("engine returned HTTP {} with an empty body", status),
        );
    }

    warn!("Engine answered HTTP {} without an error body", status);
    RelayError::engine(
        UPSTREAM_ERROR_KIND,
        format!("engine returned HTTP {}: {}", status, body.trim()),
    )
}

/// Refused connections mean the engine process is gone. The start-up probe
/// wraps its failures in a start-up error, so only requests made after the
/// engine was seen alive reach the monitor as a dead engine.
fn transport_error(e: reqwest::Error) -> RelayError {
    // Connect timeouts report both flags
    let kind = if e.is_timeout() {
        TIMEOUT_ERROR_KIND
    } else if e.is_connect() {
        DEAD_ENGINE_KIND
    } else {
        CONNECTION_ERROR_KIND
    };
    RelayError::engine(kind, e.to_string())
}
