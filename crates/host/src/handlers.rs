//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use llmrelay_common::METRICS;
use llmrelay_proto::{HealthResponse, Job, JobResponse, JobStatus, StreamFrame};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::server::HostState;

/// Job submission body
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub input: Value,
}

impl RunRequest {
    fn into_job(self) -> Job {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("job-{}", uuid::Uuid::new_v4()));
        Job::new(id, self.input)
    }
}

/// Health check endpoint
pub async fn health(State(state): State<Arc<HostState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        in_flight: state.in_flight(),
        concurrency: state.concurrency(),
    };
    (StatusCode::OK, Json(response))
}

/// Prometheus metrics endpoint
pub async fn metrics(State(state): State<Arc<HostState>>) -> Response {
    if !state.options.enable_metrics {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        METRICS.gather(),
    )
        .into_response()
}

/// Run a job to completion.
///
/// With the aggregate-stream flag every batch is returned in order as the
/// job output; without it the output is left empty and callers should use
/// `/stream`.
pub async fn run_sync(
    State(state): State<Arc<HostState>>,
    Json(request): Json<RunRequest>,
) -> Response {
    let job = request.into_job();
    let id = job.id.clone();

    let _admission = match state.try_admit() {
        Ok(guard) => guard,
        Err(e) => {
            warn!("Rejecting job {}: {}", id, e);
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(JobResponse::failed(id, e.to_string())),
            )
                .into_response();
        }
    };

    let aggregate = state.options.return_aggregate_stream;
    let mut batches = state.options.handler.handle(job);
    let mut output = Vec::new();

    while let Some(item) = batches.next().await {
        match item {
            Ok(batch) => {
                if aggregate {
                    output.push(batch);
                }
            }
            Err(e) => {
                error!("Job {} failed: {}", id, e);
                return (StatusCode::OK, Json(JobResponse::failed(id, e.to_string())))
                    .into_response();
            }
        }
    }

    let output = aggregate.then_some(output);
    (StatusCode::OK, Json(JobResponse::completed(id, output))).into_response()
}

/// Run a job and stream every batch as one NDJSON line
pub async fn run_stream(
    State(state): State<Arc<HostState>>,
    Json(request): Json<RunRequest>,
) -> Response {
    let job = request.into_job();
    let id = job.id.clone();

    let admission = match state.try_admit() {
        Ok(guard) => guard,
        Err(e) => {
            warn!("Rejecting job {}: {}", id, e);
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(JobResponse::failed(id, e.to_string())),
            )
                .into_response();
        }
    };

    let mut batches = state.options.handler.handle(job);

    let lines = async_stream::stream! {
        // Keeps the slot until the body is finished or dropped
        let _admission = admission;

        let mut final_frame = StreamFrame::Status {
            status: JobStatus::Completed,
            error: None,
        };

        while let Some(item) = batches.next().await {
            match item {
                Ok(output) => {
                    yield StreamFrame::Output { output }.to_line().map_err(std::io::Error::other);
                }
                Err(e) => {
                    error!("Job {} failed: {}", id, e);
                    final_frame = StreamFrame::Status {
                        status: JobStatus::Failed,
                        error: Some(e.to_string()),
                    };
                    break;
                }
            }
        }

        yield final_frame.to_line().map_err(std::io::Error::other);
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(lines))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
