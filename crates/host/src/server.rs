//! Host HTTP server
//!
//! Job intake routes plus health and metrics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use llmrelay_common::{RelayError, Result, METRICS};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::handlers::{health, metrics, run_stream, run_sync};
use crate::ServerlessOptions;

/// Shared host state
pub struct HostState {
    pub options: ServerlessOptions,
    in_flight: AtomicUsize,
}

impl HostState {
    pub fn new(options: ServerlessOptions) -> Self {
        Self {
            options,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Jobs currently admitted
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Ask the worker how many jobs it accepts right now
    pub fn concurrency(&self) -> usize {
        let limit = (self.options.concurrency_modifier)(self.in_flight());
        METRICS.engine.advertised_concurrency.set(limit as i64);
        limit
    }

    /// Admit one job if the worker has room for it.
    ///
    /// The returned guard releases the slot when dropped, including when the
    /// caller abandons a streamed job.
    pub fn try_admit(self: &Arc<Self>) -> Result<AdmissionGuard> {
        let limit = self.concurrency();
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .map_err(|current| {
                RelayError::overloaded(format!(
                    "{} jobs in flight, worker accepts {}",
                    current, limit
                ))
            })?;

        debug!("Admitted job, in flight: {}", self.in_flight());
        Ok(AdmissionGuard {
            state: Arc::clone(self),
        })
    }
}

/// Holds one admission slot
pub struct AdmissionGuard {
    state: Arc<HostState>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Create the host router
pub fn router(options: ServerlessOptions) -> Router {
    let state = Arc::new(HostState::new(options));

    Router::new()
        .route("/runsync", post(run_sync))
        .route("/stream", post(run_stream))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve jobs until the process exits
pub async fn start(options: ServerlessOptions, addr: &str) -> Result<()> {
    let aggregate = options.return_aggregate_stream;
    let app = router(options);

    let listener = TcpListener::bind(addr).await?;

    info!("Job host listening on http://{}", addr);
    info!("  POST /runsync - Run a job and return its output (aggregate stream: {})", aggregate);
    info!("  POST /stream  - Run a job and stream its batches as NDJSON");
    info!("  GET  /health  - Health and concurrency");
    info!("  GET  /metrics - Prometheus metrics");

    axum::serve(listener, app).await?;

    Ok(())
}
