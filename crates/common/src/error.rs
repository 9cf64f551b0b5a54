//! Common error types for llmrelay
//!
//! Every failure a job can hit is a `RelayError`. The worker's liveness
//! monitor classifies errors by their display message and `kind_name()`, so
//! messages built here must describe the failure without echoing payload
//! contents.

use thiserror::Error;

/// Main error type for llmrelay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or incomplete job input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Failure reported by the inference engine.
    ///
    /// `kind` is the engine's own error category name and `message` its text;
    /// both are carried verbatim.
    #[error("{message}")]
    Engine { kind: String, message: String },

    /// Failure while building the engine or facades at process start
    #[error("Startup error: {0}")]
    Startup(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Host at its advertised concurrency
    #[error("System overloaded: {0}")]
    Overloaded(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Category name used for failure classification.
    ///
    /// Engine errors report the engine's own kind; everything else reports a
    /// fixed name per variant.
    pub fn kind_name(&self) -> &str {
        match self {
            RelayError::Config(_) => "ConfigError",
            RelayError::Validation(_) => "ValidationError",
            RelayError::Engine { kind, .. } => kind,
            RelayError::Startup(_) => "StartupError",
            RelayError::Serialization(_) => "SerializationError",
            RelayError::Io(_) => "IoError",
            RelayError::Overloaded(_) => "OverloadedError",
            RelayError::Internal(_) => "InternalError",
        }
    }

    /// HTTP status the host reports for this error
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Validation(_) => 400,
            RelayError::Overloaded(_) => 429,
            RelayError::Engine { .. } => 502,
            RelayError::Config(_)
            | RelayError::Startup(_)
            | RelayError::Serialization(_)
            | RelayError::Io(_)
            | RelayError::Internal(_) => 500,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        RelayError::Validation(msg.into())
    }

    /// Create an engine error with the engine's kind name and message
    pub fn engine(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::Engine {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create a startup error
    pub fn startup(msg: impl Into<String>) -> Self {
        RelayError::Startup(msg.into())
    }

    /// Create an overloaded error
    pub fn overloaded(msg: impl Into<String>) -> Self {
        RelayError::Overloaded(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        RelayError::Internal(msg.into())
    }
}

/// Result type alias for llmrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;
