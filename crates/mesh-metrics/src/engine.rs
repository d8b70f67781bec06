//! Collectors updated by the serving engine

use crate::{Result, BATCH_SIZE_BUCKETS, LATENCY_BUCKETS};
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry};

/// Metrics for admission, batching, execution and device allocation
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    /// Current queue depth per model
    pub queue_depth: GaugeVec,

    /// Size of every formed batch
    pub batch_size: HistogramVec,

    /// Time the oldest request waited before its batch was flushed
    pub formation_wait_seconds: HistogramVec,

    /// Backend call latency
    pub execution_seconds: HistogramVec,

    /// Allocated fraction of each device (0.0 to 1.0)
    pub device_utilization: GaugeVec,

    /// Errors by taxonomy kind
    pub errors: CounterVec,

    /// Finished requests by outcome
    pub requests: CounterVec,

    /// Model lifecycle state code
    pub model_state: IntGaugeVec,

    /// Models evicted to make room for another load
    pub evictions: CounterVec,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            queue_depth: GaugeVec::new(
                Opts::new("servemesh_queue_depth", "Requests queued for a model"),
                &["model"],
            )?,
            batch_size: HistogramVec::new(
                HistogramOpts::new("servemesh_batch_size", "Number of requests per formed batch")
                    .buckets(BATCH_SIZE_BUCKETS.to_vec()),
                &["model"],
            )?,
            formation_wait_seconds: HistogramVec::new(
                HistogramOpts::new(
                    "servemesh_batch_formation_wait_seconds",
                    "Wait of the oldest request before its batch was flushed",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
                &["model", "reason"],
            )?,
            execution_seconds: HistogramVec::new(
                HistogramOpts::new("servemesh_execution_seconds", "Backend predict latency")
                    .buckets(LATENCY_BUCKETS.to_vec()),
                &["model"],
            )?,
            device_utilization: GaugeVec::new(
                Opts::new("servemesh_device_utilization", "Allocated fraction of a device"),
                &["device", "kind"],
            )?,
            errors: CounterVec::new(
                Opts::new("servemesh_errors_total", "Errors by kind"),
                &["model", "kind"],
            )?,
            requests: CounterVec::new(
                Opts::new("servemesh_requests_total", "Finished requests by outcome"),
                &["model", "outcome"],
            )?,
            model_state: IntGaugeVec::new(
                Opts::new("servemesh_model_state", "Model lifecycle state code"),
                &["model"],
            )?,
            evictions: CounterVec::new(
                Opts::new("servemesh_evictions_total", "Models evicted to free capacity"),
                &["device"],
            )?,
        })
    }

    /// Register all metrics with the given registry
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.queue_depth.clone()))?;
        registry.register(Box::new(self.batch_size.clone()))?;
        registry.register(Box::new(self.formation_wait_seconds.clone()))?;
        registry.register(Box::new(self.execution_seconds.clone()))?;
        registry.register(Box::new(self.device_utilization.clone()))?;
        registry.register(Box::new(self.errors.clone()))?;
        registry.register(Box::new(self.requests.clone()))?;
        registry.register(Box::new(self.model_state.clone()))?;
        registry.register(Box::new(self.evictions.clone()))?;
        Ok(())
    }

    pub fn set_queue_depth(&self, model: &str, depth: usize) {
        self.queue_depth.with_label_values(&[model]).set(depth as f64);
    }

    pub fn observe_batch(&self, model: &str, size: usize, wait_secs: f64, reason: &str) {
        self.batch_size.with_label_values(&[model]).observe(size as f64);
        self.formation_wait_seconds
            .with_label_values(&[model, reason])
            .observe(wait_secs);
    }

    pub fn observe_execution(&self, model: &str, secs: f64) {
        self.execution_seconds.with_label_values(&[model]).observe(secs);
    }

    pub fn set_device_utilization(&self, device: &str, kind: &str, fraction: f64) {
        self.device_utilization
            .with_label_values(&[device, kind])
            .set(fraction);
    }

    pub fn record_error(&self, model: &str, kind: &str) {
        self.errors.with_label_values(&[model, kind]).inc();
    }

    pub fn record_request(&self, model: &str, outcome: &str) {
        self.requests.with_label_values(&[model, outcome]).inc();
    }

    pub fn set_model_state(&self, model: &str, code: i64) {
        self.model_state.with_label_values(&[model]).set(code);
    }

    pub fn record_eviction(&self, device: &str) {
        self.evictions.with_label_values(&[device]).inc();
    }

    /// Drop the per-model gauges of a deregistered model
    pub fn forget_model(&self, model: &str) {
        let _ = self.model_state.remove_label_values(&[model]);
        let _ = self.queue_depth.remove_label_values(&[model]);
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create EngineMetrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_metrics_registration() {
        let registry = Registry::new();
        let metrics = EngineMetrics::new().unwrap();
        metrics.register(&registry).unwrap();

        // Registering the same collectors twice is rejected
        assert!(metrics.register(&registry).is_err());
    }

    #[test]
    fn test_engine_metrics_updates() {
        let registry = Registry::new();
        let metrics = EngineMetrics::new().unwrap();
        metrics.register(&registry).unwrap();

        metrics.set_queue_depth("m1", 3);
        metrics.observe_batch("m1", 4, 0.05, "max_wait");
        metrics.record_error("m1", "backpressure");
        metrics.record_error("m1", "backpressure");
        metrics.set_device_utilization("gpu0", "gpu", 0.6);

        assert_eq!(metrics.queue_depth.with_label_values(&["m1"]).get(), 3.0);
        assert_eq!(
            metrics.errors.with_label_values(&["m1", "backpressure"]).get(),
            2.0
        );
        assert_eq!(
            metrics.batch_size.with_label_values(&["m1"]).get_sample_count(),
            1
        );

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"servemesh_queue_depth".to_string()));
        assert!(names.contains(&"servemesh_device_utilization".to_string()));
    }

    #[test]
    fn test_forget_model() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.set_model_state("m1", 2);
        metrics.forget_model("m1");
        // Forgetting twice is harmless
        metrics.forget_model("m1");
        assert_eq!(metrics.model_state.with_label_values(&["m1"]).get(), 0);
    }
}
