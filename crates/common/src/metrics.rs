//! Metrics collection for llmrelay
//!
//! Prometheus metrics for job handling and engine health.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for llmrelay
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub jobs: JobMetrics,
    pub engine: EngineMetrics,
}

/// Job-level metrics
#[derive(Debug, Clone)]
pub struct JobMetrics {
    /// Total number of jobs received
    pub jobs_total: IntCounter,

    /// Jobs that finished streaming normally
    pub jobs_completed: IntCounter,

    /// Jobs that ended with a propagated error
    pub jobs_failed: IntCounter,

    /// Jobs rejected by input validation
    pub validation_failures: IntCounter,

    /// Job duration histogram
    pub job_duration: Histogram,

    /// Output batches forwarded to the host
    pub batches_emitted: IntCounter,

    /// Jobs currently being handled
    pub active_jobs: IntGauge,
}

/// Engine-facing metrics
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    /// Requests sent down the native route
    pub native_requests: IntCounter,

    /// Requests sent down the OpenAI-compatible route
    pub compatible_requests: IntCounter,

    /// Errors classified as fatal to the process
    pub fatal_errors: IntCounter,

    /// Last concurrency value reported to the host
    pub advertised_concurrency: IntGauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Job metrics
        let jobs_total = IntCounter::new("llmrelay_jobs_total", "Total number of jobs received").unwrap();

        let jobs_completed = IntCounter::new(
            "llmrelay_jobs_completed_total",
            "Total number of jobs that completed normally"
        ).unwrap();

        let jobs_failed = IntCounter::new(
            "llmrelay_jobs_failed_total",
            "Total number of jobs that failed with a reported error"
        ).unwrap();

        let validation_failures = IntCounter::new(
            "llmrelay_validation_failures_total",
            "Total number of jobs rejected by input validation"
        ).unwrap();

        let job_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "llmrelay_job_duration_seconds",
                "Job duration in seconds"
            ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0])
        ).unwrap();

        let batches_emitted = IntCounter::new(
            "llmrelay_batches_emitted_total",
            "Total number of output batches forwarded"
        ).unwrap();

        let active_jobs = IntGauge::new(
            "llmrelay_active_jobs",
            "Current number of jobs being handled"
        ).unwrap();

        // Engine metrics
        let native_requests = IntCounter::new(
            "llmrelay_native_requests_total",
            "Total number of requests routed to the native facade"
        ).unwrap();

        let compatible_requests = IntCounter::new(
            "llmrelay_compatible_requests_total",
            "Total number of requests routed to the OpenAI-compatible facade"
        ).unwrap();

        let fatal_errors = IntCounter::new(
            "llmrelay_engine_fatal_errors_total",
            "Total number of engine errors classified as fatal"
        ).unwrap();

        let advertised_concurrency = IntGauge::new(
            "llmrelay_advertised_concurrency",
            "Concurrency last reported to the host"
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(jobs_total.clone())).unwrap();
        registry.register(Box::new(jobs_completed.clone())).unwrap();
        registry.register(Box::new(jobs_failed.clone())).unwrap();
        registry.register(Box::new(validation_failures.clone())).unwrap();
        registry.register(Box::new(job_duration.clone())).unwrap();
        registry.register(Box::new(batches_emitted.clone())).unwrap();
        registry.register(Box::new(active_jobs.clone())).unwrap();

        registry.register(Box::new(native_requests.clone())).unwrap();
        registry.register(Box::new(compatible_requests.clone())).unwrap();
        registry.register(Box::new(fatal_errors.clone())).unwrap();
        registry.register(Box::new(advertised_concurrency.clone())).unwrap();

        let jobs = JobMetrics {
            jobs_total,
            jobs_completed,
            jobs_failed,
            validation_failures,
            job_duration,
            batches_emitted,
            active_jobs,
        };

        let engine = EngineMetrics {
            native_requests,
            compatible_requests,
            fatal_errors,
            advertised_concurrency,
        };

        MetricsRegistry {
            registry,
            jobs,
            engine,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
