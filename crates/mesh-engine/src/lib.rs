//! # mesh-engine
//!
//! The serving core of servemesh: model registry, device resource pool,
//! per-model dynamic batching, batch execution and request admission.
//!
//! Requests enter through the [`AdmissionRouter`], wait in a per-model queue
//! owned by the [`Scheduler`], are grouped into batches by a [`BatchFormer`]
//! task and run against the model's backend by the [`ExecutionCoordinator`].
//! The [`LifecycleManager`] moves models through their lifecycle, allocating
//! device capacity from the [`ResourcePool`] and evicting idle models when
//! that is enabled. [`Engine`] assembles all of it from a [`mesh_core::Config`].

pub mod control;
pub mod coordinator;
pub mod engine;
pub mod health;
pub mod lifecycle;
pub mod registry;
pub mod resources;
pub mod router;
pub mod scheduler;
pub mod stats;

pub use control::{ControlApplier, InMemoryCommandChannel, InMemoryConfigFeed};
pub use coordinator::{BatchOutcome, ExecutionCoordinator, ExecutionReport};
pub use engine::{Engine, ModelStatusReport};
pub use health::HealthMonitor;
pub use lifecycle::LifecycleManager;
pub use registry::{HealthReport, HealthThresholds, ModelEntry, ModelRegistry, Transition};
pub use resources::{
    DeviceSnapshot, EvictionCandidate, Evictor, ResourceHandle, ResourcePool,
};
pub use router::{AdmissionRouter, RequestHandle};
pub use scheduler::{BatchFormer, Decision, FlushReason, ModelQueue, RequestQueue, Scheduler};
pub use stats::{ModelStats, ModelStatsSnapshot};
