//! Configuration management for servemesh
//!
//! Provides a unified configuration system that supports YAML files,
//! environment variables and programmatic defaults.

use crate::model::{BatchingOverride, ModelDescriptor};
use crate::{BackendKind, DeviceKind, Error, Priority, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the serving engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Dynamic batching defaults
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Backend dispatch, retry and circuit breaking
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Backend health probing
    #[serde(default)]
    pub health: HealthConfig,

    /// Devices and eviction
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Request admission
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Logging and metrics
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Models registered at startup
    #[serde(default)]
    pub models: Vec<ModelSpec>,
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Ok(config_path) = std::env::var("SERVEMESH_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            for path in &["./servemesh.yaml", "/etc/servemesh/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        // Nested keys use a double underscore, e.g. SERVEMESH_BATCHING__MAX_BATCH_SIZE
        builder = builder.add_source(
            config::Environment::with_prefix("SERVEMESH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;

        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let parsed: Self = serde_yaml::from_str(yaml)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.batching.validate()?;
        self.execution.validate()?;
        self.health.validate()?;
        self.resources.validate()?;

        let mut names = HashSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                return Err(Error::config(format!(
                    "model {} is configured more than once",
                    model.name
                )));
            }
            model.to_descriptor().validate().map_err(|e| {
                Error::config(format!("invalid model {}: {}", model.name, e))
            })?;
            if !self
                .resources
                .devices
                .iter()
                .any(|d| d.kind == model.device_kind)
            {
                return Err(Error::config(format!(
                    "model {} requires a {} device but none is configured",
                    model.name, model.device_kind
                )));
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            batching: BatchingConfig::default(),
            execution: ExecutionConfig::default(),
            health: HealthConfig::default(),
            resources: ResourceConfig::default(),
            admission: AdmissionConfig::default(),
            observability: ObservabilityConfig::default(),
            models: Vec::new(),
        }
    }
}

/// Node-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name used in logs
    pub name: String,

    /// Custom node labels
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "servemesh".to_string(),
            labels: HashMap::new(),
        }
    }
}

/// Dynamic batching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Flush as soon as this many requests are queued
    pub max_batch_size: usize,

    /// Flush once the oldest request has waited this long
    pub max_wait_ms: u64,

    /// Admission rejects with backpressure at this queue depth
    pub backlog_limit: usize,

    /// Flush early when a queued deadline is this close
    pub deadline_slack_ms: u64,

    /// Scheduler tick tolerance
    pub tick_ms: u64,

    /// Pad variable-length inputs to the batch maximum
    pub dynamic_padding: bool,

    /// Token id used to pad token inputs
    pub pad_token_id: u32,

    /// Byte used to pad binary inputs
    #[serde(default)]
    pub pad_byte: u8,

    /// Formed batches buffered ahead of the executor
    pub max_inflight_batches: usize,
}

impl BatchingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::config("batching.max_batch_size must be > 0"));
        }
        if self.backlog_limit == 0 {
            return Err(Error::config("batching.backlog_limit must be > 0"));
        }
        if self.max_inflight_batches == 0 {
            return Err(Error::config("batching.max_inflight_batches must be > 0"));
        }
        Ok(())
    }

    /// Effective settings for one model: descriptor override, then options, then defaults
    pub fn resolve(&self, descriptor: &ModelDescriptor) -> BatchingConfig {
        let mut resolved = self.clone();
        if let Some(size) = descriptor.option_u64("max_batch_size") {
            resolved.max_batch_size = size as usize;
        }
        if let Some(wait) = descriptor.option_u64("max_wait_ms") {
            resolved.max_wait_ms = wait;
        }
        if let Some(BatchingOverride {
            max_batch_size,
            max_wait_ms,
            backlog_limit,
        }) = &descriptor.batching
        {
            if let Some(size) = max_batch_size {
                resolved.max_batch_size = *size;
            }
            if let Some(wait) = max_wait_ms {
                resolved.max_wait_ms = *wait;
            }
            if let Some(limit) = backlog_limit {
                resolved.backlog_limit = *limit;
            }
        }
        resolved.max_batch_size = resolved.max_batch_size.max(1);
        resolved
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn deadline_slack(&self) -> Duration {
        Duration::from_millis(self.deadline_slack_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_wait_ms: 50,
            backlog_limit: 1024,
            deadline_slack_ms: 5,
            tick_ms: 1,
            dynamic_padding: true,
            pad_token_id: 0,
            pad_byte: 0,
            max_inflight_batches: 2,
        }
    }
}

/// Backend dispatch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout for a single predict call
    pub predict_timeout_ms: u64,

    /// Retries after the first failed call
    pub max_retries: u32,

    /// First backoff delay, doubled on each retry
    pub backoff_base_ms: u64,

    /// Upper bound for the backoff delay
    pub backoff_max_ms: u64,

    /// Consecutive failed batches before the model is degraded
    pub degrade_after_failures: u32,
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.predict_timeout_ms == 0 {
            return Err(Error::config("execution.predict_timeout_ms must be > 0"));
        }
        if self.degrade_after_failures == 0 {
            return Err(Error::config("execution.degrade_after_failures must be > 0"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::config(
                "execution.backoff_base_ms must not exceed backoff_max_ms",
            ));
        }
        Ok(())
    }

    pub fn predict_timeout(&self) -> Duration {
        Duration::from_millis(self.predict_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            predict_timeout_ms: 30_000,
            max_retries: 2,
            backoff_base_ms: 50,
            backoff_max_ms: 2_000,
            degrade_after_failures: 3,
        }
    }
}

/// Health probing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Run the periodic probe task
    pub enabled: bool,

    /// Interval between probes
    pub interval_ms: u64,

    /// Timeout for a single probe
    pub timeout_ms: u64,

    /// Consecutive failed probes before degrading
    pub failure_threshold: u32,

    /// Consecutive passing probes before recovering
    pub success_threshold: u32,
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(Error::config("health thresholds must be > 0"));
        }
        if self.enabled && self.interval_ms == 0 {
            return Err(Error::config("health.interval_ms must be > 0"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            timeout_ms: 5_000,
            failure_threshold: 3,
            success_threshold: 1,
        }
    }
}

/// A device created at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub kind: DeviceKind,
    #[serde(default = "default_capacity")]
    pub capacity: f64,
}

fn default_capacity() -> f64 {
    1.0
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            capacity: 1.0,
        }
    }
}

/// Device pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub devices: Vec<DeviceConfig>,

    /// Evict idle models when an allocation does not fit
    pub eviction_enabled: bool,
}

impl ResourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::config("at least one device must be configured"));
        }
        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(device.id.as_str()) {
                return Err(Error::config(format!("duplicate device id {}", device.id)));
            }
            if !(device.capacity > 0.0 && device.capacity <= 1.0) {
                return Err(Error::config(format!(
                    "device {} capacity must be in (0, 1]",
                    device.id
                )));
            }
        }
        Ok(())
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceConfig::new("cpu0", DeviceKind::Cpu)],
            eviction_enabled: true,
        }
    }
}

/// Request admission configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Longest a caller waits on a request handle
    pub request_timeout_ms: u64,

    /// Priority used when the caller does not give one
    pub default_priority: Priority,
}

impl AdmissionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            default_priority: Priority::Normal,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Serve Prometheus metrics
    pub metrics_enabled: bool,

    /// Bind address for the metrics endpoint
    pub metrics_bind: String,

    /// Log level
    pub log_level: String,

    /// Log format (json or text)
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_bind: "0.0.0.0:9090".to_string(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

/// A model declared in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub backend: BackendKind,
    pub artifact: String,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    pub device_kind: DeviceKind,
    pub fraction: f64,
    #[serde(default)]
    pub priority_class: u8,
    #[serde(default)]
    pub batching: Option<BatchingOverride>,
    /// Load immediately after registration
    #[serde(default)]
    pub autoload: bool,
}

impl ModelSpec {
    pub fn to_descriptor(&self) -> ModelDescriptor {
        let mut descriptor =
            ModelDescriptor::new(self.name.clone(), self.backend.clone(), self.artifact.clone())
                .with_resources(self.device_kind, self.fraction)
                .with_priority_class(self.priority_class);
        descriptor.options = self.options.clone();
        descriptor.batching = self.batching.clone();
        descriptor
    }
}
