//! Model descriptors and the lifecycle state machine
//!
//! Every lifecycle change goes through [`ModelState::transition`], which is the
//! single transition table for the engine. Callers never assign a state
//! directly.

use crate::{BackendKind, DeviceKind, Error, ModelId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle state of a registered model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelState {
    /// Known to the registry, holds no resources
    Registered,
    /// Resources allocated, backend loading
    Loading,
    /// Serving requests
    Ready,
    /// Loaded but failing; admission rejects new requests
    Degraded,
    /// Draining and releasing resources
    Unloading,
    /// Resources released, may be loaded again
    Unloaded,
    /// Load failed; only deregistration is allowed
    Failed { reason: String },
}

/// Input to the lifecycle state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    LoadRequested,
    LoadSucceeded,
    LoadFailed(String),
    /// Load gave up before the backend was touched, e.g. no capacity
    LoadAborted,
    HealthDegraded,
    HealthRecovered,
    UnloadRequested,
    UnloadCompleted,
}

impl ModelState {
    /// Apply an event, returning the next state or `InvalidTransition`
    pub fn transition(&self, event: &LifecycleEvent) -> Result<ModelState> {
        use LifecycleEvent as E;
        use ModelState as S;

        let next = match (self, event) {
            (S::Registered | S::Unloaded, E::LoadRequested) => S::Loading,
            (S::Loading, E::LoadSucceeded) => S::Ready,
            (S::Loading, E::LoadFailed(reason)) => S::Failed {
                reason: reason.clone(),
            },
            (S::Loading, E::LoadAborted) => S::Unloaded,
            (S::Ready, E::HealthDegraded) => S::Degraded,
            (S::Degraded, E::HealthRecovered) => S::Ready,
            (S::Registered | S::Loading | S::Ready | S::Degraded, E::UnloadRequested) => {
                S::Unloading
            }
            (S::Unloading, E::UnloadCompleted) => S::Unloaded,
            (from, event) => return Err(Error::invalid_transition(from, event)),
        };
        Ok(next)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ModelState::Ready)
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self, ModelState::Loading | ModelState::Unloading)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ModelState::Failed { .. })
    }

    /// States in which the model owns a device allocation
    pub fn holds_resources(&self) -> bool {
        matches!(
            self,
            ModelState::Loading | ModelState::Ready | ModelState::Degraded | ModelState::Unloading
        )
    }

    /// Whether the model may be removed from the registry
    pub fn is_removable(&self) -> bool {
        matches!(
            self,
            ModelState::Registered | ModelState::Unloaded | ModelState::Failed { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelState::Registered => "registered",
            ModelState::Loading => "loading",
            ModelState::Ready => "ready",
            ModelState::Degraded => "degraded",
            ModelState::Unloading => "unloading",
            ModelState::Unloaded => "unloaded",
            ModelState::Failed { .. } => "failed",
        }
    }

    /// Stable numeric code, used for the model state gauge
    pub fn code(&self) -> i64 {
        match self {
            ModelState::Registered => 0,
            ModelState::Loading => 1,
            ModelState::Ready => 2,
            ModelState::Degraded => 3,
            ModelState::Unloading => 4,
            ModelState::Unloaded => 5,
            ModelState::Failed { .. } => 6,
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelState::Failed { reason } => write!(f, "failed ({})", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::LoadRequested => write!(f, "load_requested"),
            LifecycleEvent::LoadSucceeded => write!(f, "load_succeeded"),
            LifecycleEvent::LoadFailed(_) => write!(f, "load_failed"),
            LifecycleEvent::LoadAborted => write!(f, "load_aborted"),
            LifecycleEvent::HealthDegraded => write!(f, "health_degraded"),
            LifecycleEvent::HealthRecovered => write!(f, "health_recovered"),
            LifecycleEvent::UnloadRequested => write!(f, "unload_requested"),
            LifecycleEvent::UnloadCompleted => write!(f, "unload_completed"),
        }
    }
}

/// Device share a model needs while loaded
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub device_kind: DeviceKind,
    /// Normalized share of one device, in (0.0, 1.0]
    pub fraction: f64,
}

impl Default for ResourceRequirement {
    fn default() -> Self {
        Self {
            device_kind: DeviceKind::Cpu,
            fraction: 0.1,
        }
    }
}

/// Per-model overrides of the engine batching defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchingOverride {
    #[serde(default)]
    pub max_batch_size: Option<usize>,
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
    #[serde(default)]
    pub backlog_limit: Option<usize>,
}

/// Everything the engine knows about a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: ModelId,

    /// Unique model name used for routing
    pub name: String,

    pub backend: BackendKind,

    /// Model artifact location (path or URI)
    pub artifact: String,

    /// Backend-specific options, e.g. context length
    pub options: HashMap<String, serde_json::Value>,

    pub resources: ResourceRequirement,

    /// Eviction priority class; lower classes are evicted first
    pub priority_class: u8,

    pub batching: Option<BatchingOverride>,

    pub state: ModelState,

    /// Incremented on every lifecycle transition
    pub version: u64,

    pub registered_at: DateTime<Utc>,
}

impl ModelDescriptor {
    /// Create a new descriptor in the `Registered` state
    pub fn new(name: impl Into<String>, backend: BackendKind, artifact: impl Into<String>) -> Self {
        Self {
            id: ModelId::generate(),
            name: name.into(),
            backend,
            artifact: artifact.into(),
            options: HashMap::new(),
            resources: ResourceRequirement::default(),
            priority_class: 0,
            batching: None,
            state: ModelState::Registered,
            version: 0,
            registered_at: Utc::now(),
        }
    }

    pub fn with_resources(mut self, device_kind: DeviceKind, fraction: f64) -> Self {
        self.resources = ResourceRequirement {
            device_kind,
            fraction,
        };
        self
    }

    pub fn with_priority_class(mut self, class: u8) -> Self {
        self.priority_class = class;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn with_batching(mut self, batching: BatchingOverride) -> Self {
        self.batching = Some(batching);
        self
    }

    /// Read an unsigned integer option
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.as_u64())
    }

    /// Check the descriptor can be registered
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("model name cannot be empty"));
        }
        if !(self.resources.fraction > 0.0 && self.resources.fraction <= 1.0) {
            return Err(Error::validation(format!(
                "resource fraction for {} must be in (0, 1], got {}",
                self.name, self.resources.fraction
            )));
        }
        if let Some(batching) = &self.batching {
            if batching.max_batch_size == Some(0) {
                return Err(Error::validation("max_batch_size override must be > 0"));
            }
            if batching.backlog_limit == Some(0) {
                return Err(Error::validation("backlog_limit override must be > 0"));
            }
        }
        Ok(())
    }
}
