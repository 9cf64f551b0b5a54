//! llmrelay common library
//!
//! Shared error type, configuration and metrics for the worker and host crates.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use metrics::{MetricsRegistry, METRICS};
