//! llmrelay wire types
//!
//! Shapes exchanged between the job host and the worker handler. Output
//! batches are opaque JSON values; nothing in this crate looks inside them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of work delivered by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier assigned by the host (generated when the caller omits it)
    #[serde(default)]
    pub id: String,

    /// Raw input mapping, validated later by the worker
    #[serde(default)]
    pub input: Value,
}

impl Job {
    pub fn new(id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            input,
        }
    }
}

/// One increment of generated content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputBatch(pub Value);

impl OutputBatch {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> Value {
        self.0
    }
}

impl From<Value> for OutputBatch {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Final state of a job as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// Response body of a synchronous run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,

    /// Every batch in order when the aggregate-stream flag is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<OutputBatch>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResponse {
    pub fn completed(id: impl Into<String>, output: Option<Vec<OutputBatch>>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Completed,
            output,
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// One line of a streamed job (newline-delimited JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamFrame {
    Output { output: OutputBatch },
    Status {
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl StreamFrame {
    /// Serialize as a single NDJSON line
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Host health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub in_flight: usize,
    pub concurrency: usize,
}
