//! # mesh-metrics
//!
//! Prometheus metrics for servemesh.
//!
//! This crate provides:
//! - [`EngineMetrics`], the collectors the serving engine updates: queue depth,
//!   batch size distribution, device utilization, errors by kind and request
//!   outcomes
//! - [`PrometheusExporter`], which renders a registry in the text exposition
//!   format and can serve it on `/metrics`, with a `/health` answer taken
//!   from any [`Readiness`] source

pub mod engine;
pub mod prometheus_metrics;

pub use engine::EngineMetrics;
pub use prometheus_metrics::{PrometheusExporter, Readiness};

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<prometheus::Error> for MetricsError {
    fn from(err: prometheus::Error) -> Self {
        MetricsError::Registry(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MetricsError>;

/// Histogram buckets for batch sizes
pub const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0];

/// Histogram buckets for latencies in seconds
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: MetricsError = prometheus::Error::Msg("boom".to_string()).into();
        assert!(matches!(err, MetricsError::Registry(_)));
        assert_eq!(err.to_string(), "Registry error: boom");
    }

    #[test]
    fn test_buckets_sorted() {
        assert!(BATCH_SIZE_BUCKETS.windows(2).all(|w| w[0] < w[1]));
        assert!(LATENCY_BUCKETS.windows(2).all(|w| w[0] < w[1]));
    }
}
