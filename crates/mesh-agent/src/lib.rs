//! # mesh-agent
//!
//! The servemesh daemon (meshd).
//!
//! This crate wraps the serving engine in a long-running process: it loads
//! configuration, initializes logging, starts the engine with the built-in
//! backends, optionally serves Prometheus metrics and shuts everything down
//! on SIGINT or SIGTERM.

pub mod agent;
pub mod config;

// Re-export commonly used types
pub use agent::{Agent, AgentBuilder};
pub use config::AgentConfig;

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] mesh_core::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] mesh_metrics::MetricsError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Initialize logging and build the agent
pub fn init_agent(config: &AgentConfig) -> Result<Agent> {
    init_logging(config)?;

    tracing::info!(
        node = %config.core.node.name,
        models = config.core.models.len(),
        "Initializing servemesh daemon"
    );

    AgentBuilder::new().with_config(config.clone()).build()
}

/// Initialize logging and tracing
pub fn init_logging(config: &AgentConfig) -> Result<()> {
    let observability = &config.core.observability;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&observability.log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.logging.show_target)
        .with_thread_ids(config.logging.show_thread_ids)
        .with_line_number(config.logging.show_line_numbers);

    let result = match observability.log_format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };
    result.map_err(|e| AgentError::Config(format!("Failed to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: AgentError = mesh_core::Error::model_not_found("m1").into();
        assert!(matches!(err, AgentError::Core(_)));
        assert!(err.to_string().starts_with("Core error"));
    }

    #[test]
    fn test_logging_initializes_once() {
        let config = AgentConfig::default();
        let _ = init_logging(&config);

        // The global subscriber can only be installed once
        assert!(init_logging(&config).is_err());
    }
}
