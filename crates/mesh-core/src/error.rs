//! Error handling for servemesh
//!
//! Provides the engine-wide error taxonomy and result type. Errors are `Clone`
//! because a single backend failure fans out to every request of a batch.

use crate::types::RequestId;
use std::fmt;

/// Result type alias for servemesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for servemesh
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Target model is not registered
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Target model exists but cannot serve
    #[error("Model not ready: {model} is {state}")]
    ModelNotReady { model: String, state: String },

    /// A model with this name is already registered
    #[error("Duplicate model: {0}")]
    DuplicateModel(String),

    /// No device has enough free capacity
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The device backing a model is not live
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Request deadline elapsed before it could be batched or completed
    #[error("Batch timeout: {0}")]
    BatchTimeout(String),

    /// Queue for the target model is full
    #[error("Backpressure: queue for {model} is at {depth}/{limit}")]
    Backpressure {
        model: String,
        depth: usize,
        limit: usize,
    },

    /// Payload or request parameters are invalid
    #[error("Validation error: {0}")]
    Validation(String),

    /// Backend reported an error for a single item
    #[error("Plugin execution error: {0}")]
    PluginExecution(String),

    /// Backend call failed as a whole (error, timeout or malformed response)
    #[error("Plugin call failed: {0}")]
    PluginCallFailed(String),

    /// Lifecycle transition not allowed from the current state
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Concurrent writer won the compare-and-swap
    #[error("Version conflict: {0}")]
    VersionConflict(String),

    /// Request was cancelled by its caller
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Create a model not found error
    pub fn model_not_found(model: impl Into<String>) -> Self {
        Self::ModelNotFound(model.into())
    }

    /// Create a model not ready error
    pub fn model_not_ready(model: impl Into<String>, state: impl fmt::Display) -> Self {
        Self::ModelNotReady {
            model: model.into(),
            state: state.to_string(),
        }
    }

    /// Create a duplicate model error
    pub fn duplicate_model(model: impl Into<String>) -> Self {
        Self::DuplicateModel(model.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a resource unavailable error
    pub fn resource_unavailable(msg: impl Into<String>) -> Self {
        Self::ResourceUnavailable(msg.into())
    }

    /// Create a batch timeout error
    pub fn batch_timeout(msg: impl Into<String>) -> Self {
        Self::BatchTimeout(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a per-item plugin execution error
    pub fn plugin_execution(msg: impl Into<String>) -> Self {
        Self::PluginExecution(msg.into())
    }

    /// Create a whole-call plugin failure
    pub fn plugin_call_failed(msg: impl Into<String>) -> Self {
        Self::PluginCallFailed(msg.into())
    }

    /// Create an invalid transition error
    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create a version conflict error
    pub fn version_conflict(msg: impl Into<String>) -> Self {
        Self::VersionConflict(msg.into())
    }

    /// Create a cancelled error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check if this error is retryable at the batch level
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PluginCallFailed(_) | Error::ResourceUnavailable(_) | Error::VersionConflict(_)
        )
    }

    /// Errors returned synchronously by admission, never queued
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Error::ModelNotFound(_)
                | Error::ModelNotReady { .. }
                | Error::Validation(_)
                | Error::Backpressure { .. }
        )
    }

    /// Check if this error indicates a client-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::ModelNotFound(_)
                | Error::DuplicateModel(_)
                | Error::Validation(_)
                | Error::InvalidTransition { .. }
                | Error::InvalidConfiguration(_)
                | Error::Cancelled(_)
        )
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::ModelNotFound(_) => "model_not_found",
            Error::ModelNotReady { .. } => "model_not_ready",
            Error::DuplicateModel(_) => "duplicate_model",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::ResourceUnavailable(_) => "resource_unavailable",
            Error::BatchTimeout(_) => "batch_timeout",
            Error::Backpressure { .. } => "backpressure",
            Error::Validation(_) => "validation",
            Error::PluginExecution(_) => "plugin_execution",
            Error::PluginCallFailed(_) => "plugin_call_failed",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::VersionConflict(_) => "version_conflict",
            Error::Cancelled(_) => "cancelled",
            Error::InvalidConfiguration(_) => "configuration",
            Error::Internal(_) => "internal",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }

    /// Convert to HTTP status code (useful for REST APIs)
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::InvalidConfiguration(_) => 400,
            Error::ModelNotFound(_) => 404,
            Error::BatchTimeout(_) => 408,
            Error::DuplicateModel(_)
            | Error::InvalidTransition { .. }
            | Error::VersionConflict(_) => 409,
            Error::Backpressure { .. } => 429,
            Error::Cancelled(_) => 499,
            Error::ModelNotReady { .. }
            | Error::ResourceExhausted(_)
            | Error::ResourceUnavailable(_) => 503,
            Error::PluginCallFailed(_) => 502,
            _ => 500,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("json: {}", err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(format!("yaml: {}", err))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::InvalidConfiguration(err.to_string())
    }
}

/// An error delivered to a caller, tagged with the originating request
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("[{request_id}] {error}")]
pub struct RequestError {
    pub request_id: RequestId,
    #[source]
    pub error: Error,
}

impl RequestError {
    pub fn new(request_id: RequestId, error: Error) -> Self {
        Self { request_id, error }
    }

    pub fn kind(&self) -> &'static str {
        self.error.category()
    }
}

/// Extension trait for adding context to Results
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Internal(format!("{}: {}", context.into(), e.into())))
    }

    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Internal(format!("{}: {}", f(), e.into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::model_not_found("ghost");
        assert!(matches!(err, Error::ModelNotFound(_)));
        assert_eq!(err.to_string(), "Model not found: ghost");

        let err = Error::model_not_ready("m1", "degraded");
        assert_eq!(err.to_string(), "Model not ready: m1 is degraded");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::config("test").category(), "configuration");
        assert_eq!(Error::plugin_execution("x").category(), "plugin_execution");
        assert_eq!(
            Error::Backpressure {
                model: "m".into(),
                depth: 4,
                limit: 4
            }
            .category(),
            "backpressure"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::model_not_found("a").is_admission_error());
        assert!(Error::validation("empty").is_admission_error());
        assert!(!Error::resource_exhausted("gpu").is_admission_error());

        assert!(Error::plugin_call_failed("boom").is_retryable());
        assert!(!Error::plugin_execution("item").is_retryable());
        assert!(Error::duplicate_model("m").is_client_error());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(Error::validation("test").to_http_status(), 400);
        assert_eq!(Error::model_not_found("test").to_http_status(), 404);
        assert_eq!(Error::model_not_ready("m", "loading").to_http_status(), 503);
        assert_eq!(Error::internal("test").to_http_status(), 500);
    }

    #[test]
    fn test_request_error_carries_id() {
        let id = RequestId::generate();
        let err = RequestError::new(id.clone(), Error::batch_timeout("deadline"));
        assert_eq!(err.request_id, id);
        assert_eq!(err.kind(), "batch_timeout");
        assert!(err.to_string().starts_with(&format!("[{}]", id)));
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));

        let err = result.with_context("failed to read config file").unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(err.to_string().contains("failed to read config file"));
        assert!(err.to_string().contains("file not found"));
    }
}
