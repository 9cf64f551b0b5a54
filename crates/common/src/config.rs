//! Configuration structures for llmrelay
//!
//! Configuration is loaded from a YAML file (or built from defaults) and then
//! overridden by environment variables, so a serverless deployment can be
//! tuned without shipping a new file.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Top-level configuration for the worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Host server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Host server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Inference engine connection
    #[serde(default)]
    pub engine: EngineConfig,

    /// Default output batching
    #[serde(default)]
    pub batching: BatchingConfig,

    /// OpenAI-compatible route settings
    #[serde(default)]
    pub openai: OpenAiConfig,

    /// Engine failure detection
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Options handed to the job host
    #[serde(default)]
    pub host: HostConfig,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Inference engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the OpenAI-compatible inference server
    #[serde(default = "default_engine_base_url")]
    pub base_url: String,

    /// Served model name; discovered from the engine when absent
    pub model: Option<String>,

    /// Maximum concurrent requests the engine accepts
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-request timeout in seconds (0 = no timeout)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Probe attempts while waiting for the engine at start-up
    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,

    /// Delay between start-up probes
    #[serde(default = "default_startup_retry_interval")]
    pub startup_retry_interval_ms: u64,
}

/// Output batching defaults, overridable per job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Largest number of tokens (or chunks) per batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// First batch size when growth is enabled
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// Multiplier applied to the batch size after every emitted batch
    #[serde(default = "default_growth_factor")]
    pub batch_size_growth_factor: f64,
}

/// OpenAI-compatible route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// Emit streamed batches as concatenated SSE text instead of parsed objects
    #[serde(default = "default_true")]
    pub raw_output: bool,
}

/// Extra fatal markers on top of the built-in tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LivenessConfig {
    #[serde(default)]
    pub extra_message_markers: Vec<String>,

    #[serde(default)]
    pub extra_kind_markers: Vec<String>,
}

/// Options passed through to the job host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Treat batches as one aggregate stream
    #[serde(default = "default_true")]
    pub return_aggregate_stream: bool,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Expose Prometheus metrics on the host
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_engine_base_url() -> String {
    "http://127.0.0.1:30000".to_string()
}

fn default_max_concurrency() -> usize {
    300
}

fn default_request_timeout() -> u64 {
    0
}

fn default_startup_retries() -> u32 {
    60
}

fn default_startup_retry_interval() -> u64 {
    1000
}

fn default_max_batch_size() -> usize {
    50
}

fn default_min_batch_size() -> usize {
    1
}

fn default_growth_factor() -> f64 {
    3.0
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_base_url(),
            model: None,
            max_concurrency: default_max_concurrency(),
            request_timeout_secs: default_request_timeout(),
            startup_retries: default_startup_retries(),
            startup_retry_interval_ms: default_startup_retry_interval(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            min_batch_size: default_min_batch_size(),
            batch_size_growth_factor: default_growth_factor(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self { raw_output: true }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            return_aggregate_stream: true,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            engine: EngineConfig::default(),
            batching: BatchingConfig::default(),
            openai: OpenAiConfig::default(),
            liveness: LivenessConfig::default(),
            host: HostConfig::default(),
            observability: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            RelayError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: RelayConfig = serde_yaml::from_str(&content).map_err(|e| {
            RelayError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `LLMRELAY_CONFIG` when set, otherwise from defaults, then
    /// apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("LLMRELAY_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => RelayConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    ///
    /// Takes a lookup function instead of reading the process environment
    /// directly so overrides can be exercised in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LLMRELAY_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = lookup("LLMRELAY_PORT") {
            self.port = parse_var("LLMRELAY_PORT", &v)?;
        }
        if let Some(v) = lookup("ENGINE_BASE_URL") {
            self.engine.base_url = v;
        }
        if let Some(v) = lookup("ENGINE_MODEL") {
            self.engine.model = Some(v);
        }
        if let Some(v) = lookup("MAX_CONCURRENCY") {
            self.engine.max_concurrency = parse_var("MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("DEFAULT_BATCH_SIZE") {
            self.batching.max_batch_size = parse_var("DEFAULT_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("DEFAULT_MIN_BATCH_SIZE") {
            self.batching.min_batch_size = parse_var("DEFAULT_MIN_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("DEFAULT_BATCH_SIZE_GROWTH_FACTOR") {
            self.batching.batch_size_growth_factor =
                parse_var("DEFAULT_BATCH_SIZE_GROWTH_FACTOR", &v)?;
        }
        if let Some(v) = lookup("RAW_OPENAI_OUTPUT") {
            self.openai.raw_output = parse_flag(&v);
        }

        debug!(
            "Effective config: engine={} max_concurrency={} batch={}..{} x{}",
            self.engine.base_url,
            self.engine.max_concurrency,
            self.batching.min_batch_size,
            self.batching.max_batch_size,
            self.batching.batch_size_growth_factor
        );
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine.base_url.trim().is_empty() {
            return Err(RelayError::config("engine.base_url must not be empty"));
        }
        if self.engine.max_concurrency == 0 {
            return Err(RelayError::config("engine.max_concurrency must be at least 1"));
        }
        if self.batching.max_batch_size == 0 {
            return Err(RelayError::config("batching.max_batch_size must be at least 1"));
        }
        if !self.batching.batch_size_growth_factor.is_finite()
            || self.batching.batch_size_growth_factor <= 0.0
        {
            return Err(RelayError::config(
                "batching.batch_size_growth_factor must be a positive number",
            ));
        }
        Ok(())
    }

    /// Host socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Per-request engine timeout, if any
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.engine.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Delay between start-up probes as Duration
    pub fn startup_retry_interval(&self) -> Duration {
        Duration::from_millis(self.engine.startup_retry_interval_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("Invalid value for {}", name)))
}

/// Truthy strings: "1", "true", "yes", "on" (case-insensitive)
fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
