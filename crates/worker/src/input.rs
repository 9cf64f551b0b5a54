//! Job input normalization
//!
//! Turns the loosely typed `input` mapping of a job into a
//! [`RequestDescriptor`]. The `openai_route` field picks the route:
//!
//! | `openai_route`                  | route                               |
//! |---------------------------------|-------------------------------------|
//! | absent, `null`, `false`, `""`, `0` | native                           |
//! | `true` or a non-zero number     | compatible, path inferred from body |
//! | `"/v1/..."`                     | compatible, that path               |
//!
//! Error messages name the offending field and never repeat its value.

use llmrelay_common::{RelayError, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::batching::BatchPolicy;
use crate::engine::{ChatMessage, Prompt, SamplingParams};

/// `max_tokens` used by the native route when the job sets none
pub const DEFAULT_MAX_TOKENS: u32 = 100;

/// Which facade serves a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Native,
    Compatible,
}

/// OpenAI-compatible endpoints the compatible facade understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiRoute {
    Models,
    ChatCompletions,
    Completions,
}

impl OpenAiRoute {
    pub fn from_path(path: &str) -> Result<Self> {
        match path.trim_end_matches('/') {
            "/v1/models" => Ok(OpenAiRoute::Models),
            "/v1/chat/completions" => Ok(OpenAiRoute::ChatCompletions),
            "/v1/completions" => Ok(OpenAiRoute::Completions),
            _ => Err(RelayError::validation(
                "openai_route must be /v1/models, /v1/chat/completions or /v1/completions",
            )),
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            OpenAiRoute::Models => "/v1/models",
            OpenAiRoute::ChatCompletions => "/v1/chat/completions",
            OpenAiRoute::Completions => "/v1/completions",
        }
    }
}

/// OpenAI request body, typed where the worker needs it
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OpenAiRequest {
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,

    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub stream: bool,

    #[serde(flatten)]
    pub sampling: SamplingParams,
}

/// Parameters for the native route
#[derive(Debug, Clone, PartialEq)]
pub struct NativeParams {
    pub prompt: Prompt,
    pub sampling: SamplingParams,
    pub stream: bool,
    pub batch_policy: BatchPolicy,
}

/// Parameters for the compatible route
#[derive(Debug, Clone, PartialEq)]
pub struct CompatibleParams {
    pub route: OpenAiRoute,
    pub request: OpenAiRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestParams {
    Native(NativeParams),
    Compatible(CompatibleParams),
}

/// Validated, immutable description of one job's request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub request_id: String,
    pub params: RequestParams,
}

impl RequestDescriptor {
    /// Validate a job's `input` mapping.
    ///
    /// `defaults` supplies the batch policy for fields the job leaves unset.
    pub fn from_input(input: &Value, defaults: &BatchPolicy) -> Result<Self> {
        let input = input
            .as_object()
            .ok_or_else(|| RelayError::validation("job input must be an object"))?;

        let params = match route_marker(input)? {
            Marker::Native => RequestParams::Native(native_params(input, defaults)?),
            Marker::Compatible(route) => {
                RequestParams::Compatible(compatible_params(input, route)?)
            }
        };

        Ok(Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            params,
        })
    }

    /// Routing flag derived from the input
    pub fn route(&self) -> RouteKind {
        match self.params {
            RequestParams::Native(_) => RouteKind::Native,
            RequestParams::Compatible(_) => RouteKind::Compatible,
        }
    }
}

enum Marker {
    Native,
    /// `None` means the path is inferred from the body
    Compatible(Option<OpenAiRoute>),
}

fn route_marker(input: &Map<String, Value>) -> Result<Marker> {
    match input.get("openai_route") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(Marker::Native),
        Some(Value::Bool(true)) => Ok(Marker::Compatible(None)),
        Some(Value::String(path)) if path.is_empty() => Ok(Marker::Native),
        Some(Value::String(path)) => Ok(Marker::Compatible(Some(OpenAiRoute::from_path(path)?))),
        Some(Value::Number(n)) if n.as_f64() == Some(0.0) => Ok(Marker::Native),
        Some(Value::Number(_)) => Ok(Marker::Compatible(None)),
        Some(_) => Err(RelayError::validation(
            "openai_route must be a boolean or a route path",
        )),
    }
}

/// Field lookup treating explicit `null` as absent
fn field<'a>(input: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    input.get(key).filter(|value| !value.is_null())
}

fn bool_field(input: &Map<String, Value>, key: &str) -> Result<bool> {
    match field(input, key) {
        None => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(_) => Err(RelayError::validation(format!("{} must be a boolean", key))),
    }
}

fn native_params(input: &Map<String, Value>, defaults: &BatchPolicy) -> Result<NativeParams> {
    let prompt = if let Some(messages) = field(input, "messages") {
        Prompt::Messages(parse_messages(messages)?)
    } else if let Some(prompt) = field(input, "prompt") {
        match prompt {
            Value::String(text) => Prompt::Text(text.clone()),
            _ => return Err(RelayError::validation("prompt must be a string")),
        }
    } else {
        return Err(RelayError::validation(
            "input requires either prompt or messages",
        ));
    };

    let prompt = match prompt {
        Prompt::Text(text) if bool_field(input, "apply_chat_template")? => {
            Prompt::Messages(vec![ChatMessage::user(text)])
        }
        prompt => prompt,
    };

    let mut sampling: SamplingParams = match field(input, "sampling_params") {
        None => SamplingParams::default(),
        Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())
            .map_err(|_| RelayError::validation("sampling_params has a field of the wrong type"))?,
        Some(_) => return Err(RelayError::validation("sampling_params must be an object")),
    };
    if sampling.max_tokens.is_none() {
        sampling.max_tokens = Some(DEFAULT_MAX_TOKENS);
    }

    Ok(NativeParams {
        prompt,
        sampling,
        stream: bool_field(input, "stream")?,
        batch_policy: batch_policy(input, defaults)?,
    })
}

fn parse_messages(messages: &Value) -> Result<Vec<ChatMessage>> {
    let messages: Vec<ChatMessage> = serde_json::from_value(messages.clone()).map_err(|_| {
        RelayError::validation("messages must be an array of {role, content} objects")
    })?;
    if messages.is_empty() {
        return Err(RelayError::validation("messages must not be empty"));
    }
    Ok(messages)
}

fn batch_policy(input: &Map<String, Value>, defaults: &BatchPolicy) -> Result<BatchPolicy> {
    let mut policy = *defaults;

    if let Some(value) = field(input, "max_batch_size") {
        policy.max_batch_size = positive_int(value, "max_batch_size")?;
    }
    if let Some(value) = field(input, "min_batch_size") {
        policy.min_batch_size = positive_int(value, "min_batch_size")?;
    }
    if let Some(value) = field(input, "batch_size_growth_factor") {
        policy.growth_factor = value
            .as_f64()
            .filter(|factor| factor.is_finite() && *factor > 0.0)
            .ok_or_else(|| {
                RelayError::validation("batch_size_growth_factor must be a positive number")
            })?;
    }

    Ok(policy)
}

fn positive_int(value: &Value, name: &str) -> Result<usize> {
    value
        .as_u64()
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .ok_or_else(|| RelayError::validation(format!("{} must be a positive integer", name)))
}

fn compatible_params(
    input: &Map<String, Value>,
    route: Option<OpenAiRoute>,
) -> Result<CompatibleParams> {
    let body = match field(input, "openai_input") {
        Some(Value::Object(body)) => body.clone(),
        Some(_) => return Err(RelayError::validation("openai_input must be an object")),
        None => synthesize_body(input)?,
    };

    let route = route.unwrap_or(if body.contains_key("messages") {
        OpenAiRoute::ChatCompletions
    } else {
        OpenAiRoute::Completions
    });

    let request = match route {
        OpenAiRoute::Models => OpenAiRequest::default(),
        OpenAiRoute::ChatCompletions | OpenAiRoute::Completions => {
            serde_json::from_value(Value::Object(body)).map_err(|_| {
                RelayError::validation(format!(
                    "openai_input is not a valid {} request",
                    route.path()
                ))
            })?
        }
    };

    match route {
        OpenAiRoute::ChatCompletions if request.messages.as_ref().map_or(true, Vec::is_empty) => {
            return Err(RelayError::validation("chat completions require messages"));
        }
        OpenAiRoute::Completions if request.prompt.is_none() => {
            return Err(RelayError::validation("completions require a prompt"));
        }
        _ => {}
    }

    Ok(CompatibleParams { route, request })
}

/// Build an OpenAI body from top-level job fields when `openai_input` is absent
fn synthesize_body(input: &Map<String, Value>) -> Result<Map<String, Value>> {
    let mut body = Map::new();

    for key in ["model", "messages", "prompt", "stream"] {
        if let Some(value) = field(input, key) {
            body.insert(key.to_string(), value.clone());
        }
    }

    match field(input, "sampling_params") {
        None => {}
        Some(Value::Object(sampling)) => {
            for (key, value) in sampling {
                body.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Some(_) => return Err(RelayError::validation("sampling_params must be an object")),
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(input: Value) -> Result<RequestDescriptor> {
        RequestDescriptor::from_input(&input, &BatchPolicy::default())
    }

    fn native(input: Value) -> NativeParams {
        match parse(input).unwrap().params {
            RequestParams::Native(params) => params,
            other => panic!("expected native params, got {:?}", other),
        }
    }

    fn compatible(input: Value) -> CompatibleParams {
        match parse(input).unwrap().params {
            RequestParams::Compatible(params) => params,
            other => panic!("expected compatible params, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_marker_routes_native() {
        let descriptor = parse(json!({"prompt": "hi"})).unwrap();
        assert_eq!(descriptor.route(), RouteKind::Native);

        for marker in [json!(null), json!(false), json!(""), json!(0)] {
            let descriptor = parse(json!({"prompt": "hi", "openai_route": marker})).unwrap();
            assert_eq!(descriptor.route(), RouteKind::Native);
        }
    }

    #[test]
    fn test_truthy_marker_routes_compatible() {
        let params = compatible(json!({
            "openai_route": true,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(params.route, OpenAiRoute::ChatCompletions);
        assert_eq!(params.request.messages.unwrap()[0].role, "user");

        let params = compatible(json!({"openai_route": 1, "prompt": "Once"}));
        assert_eq!(params.route, OpenAiRoute::Completions);
    }

    #[test]
    fn test_route_path_and_openai_input() {
        let params = compatible(json!({
            "openai_route": "/v1/chat/completions",
            "openai_input": {
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
                "max_tokens": 10,
                "seed": 3
            }
        }));
        assert_eq!(params.route, OpenAiRoute::ChatCompletions);
        assert!(params.request.stream);
        assert_eq!(params.request.model.as_deref(), Some("m"));
        assert_eq!(params.request.sampling.max_tokens, Some(10));
        assert_eq!(params.request.sampling.extra["seed"], 3);

        let params = compatible(json!({"openai_route": "/v1/models"}));
        assert_eq!(params.route, OpenAiRoute::Models);
    }

    #[test]
    fn test_unknown_route_rejected() {
        let err = parse(json!({"openai_route": "/v1/embeddings"})).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        let err = parse(json!({"openai_route": ["x"]})).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_native_defaults() {
        let params = native(json!({"prompt": "hi"}));
        assert_eq!(params.prompt, Prompt::Text("hi".into()));
        assert!(!params.stream);
        assert_eq!(params.sampling.max_tokens, Some(DEFAULT_MAX_TOKENS));
        assert_eq!(params.batch_policy, BatchPolicy::default());
    }

    #[test]
    fn test_native_overrides() {
        let params = native(json!({
            "prompt": "hi",
            "apply_chat_template": true,
            "stream": true,
            "sampling_params": {"max_tokens": 5, "n": 2, "stop": ["\n"]},
            "max_batch_size": 8,
            "min_batch_size": 2,
            "batch_size_growth_factor": 2
        }));
        assert_eq!(params.prompt, Prompt::Messages(vec![ChatMessage::user("hi")]));
        assert!(params.stream);
        assert_eq!(params.sampling.max_tokens, Some(5));
        assert_eq!(params.sampling.choices(), 2);
        assert_eq!(params.sampling.extra["stop"], json!(["\n"]));
        assert_eq!(params.batch_policy.max_batch_size, 8);
        assert_eq!(params.batch_policy.min_batch_size, 2);
        assert_eq!(params.batch_policy.growth_factor, 2.0);
    }

    #[test]
    fn test_messages_win_over_prompt() {
        let params = native(json!({
            "prompt": "ignored",
            "messages": [{"role": "system", "content": "be brief"}]
        }));
        assert!(matches!(params.prompt, Prompt::Messages(ref m) if m.len() == 1));
    }

    #[test]
    fn test_missing_required_fields() {
        for input in [
            json!({}),
            json!({"stream": true}),
            json!({"prompt": 42}),
            json!({"messages": []}),
            json!({"messages": "hello"}),
            json!("not an object"),
            json!(null),
        ] {
            let err = parse(input).unwrap_err();
            assert!(matches!(err, RelayError::Validation(_)), "{:?}", err);
        }
    }

    #[test]
    fn test_malformed_optional_fields() {
        for input in [
            json!({"prompt": "hi", "stream": "yes"}),
            json!({"prompt": "hi", "sampling_params": []}),
            json!({"prompt": "hi", "sampling_params": {"max_tokens": "many"}}),
            json!({"prompt": "hi", "max_batch_size": 0}),
            json!({"prompt": "hi", "batch_size_growth_factor": -1}),
        ] {
            assert!(parse(input).is_err());
        }
    }

    #[test]
    fn test_compatible_requires_body_fields() {
        let err = parse(json!({"openai_route": "/v1/chat/completions", "openai_input": {}})).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        let err = parse(json!({"openai_route": "/v1/completions", "openai_input": {}})).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        let err = parse(json!({"openai_route": true, "openai_input": "x"})).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_validation_messages_do_not_echo_payload() {
        let err = parse(json!({"messages": "engine is dead"})).unwrap_err();
        assert!(!err.to_string().contains("engine is dead"));
    }

    #[test]
    fn test_each_descriptor_gets_fresh_request_id() {
        let a = parse(json!({"prompt": "hi"})).unwrap();
        let b = parse(json!({"prompt": "hi"})).unwrap();
        assert_ne!(a.request_id, b.request_id);
    }
}
