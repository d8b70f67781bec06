//! # mesh-core
//!
//! Core types, traits, and utilities for servemesh, the admission, batching and
//! resource allocation core of a multi-backend inference server.
//!
//! This crate provides the foundational data structures and interfaces that are
//! shared across all other servemesh components. It includes:
//!
//! - Model descriptors and the lifecycle state machine
//! - Requests, batches and typed payloads
//! - The backend plugin and coordination service traits
//! - Configuration schema and parsing utilities
//! - Error handling types and utilities

pub mod config;
pub mod error;
pub mod model;
pub mod payload;
pub mod request;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{
    AdmissionConfig, BatchingConfig, Config, DeviceConfig, ExecutionConfig, HealthConfig,
    ModelSpec, ObservabilityConfig, ResourceConfig,
};
pub use error::{Error, ErrorContext, RequestError, Result};
pub use model::{BatchingOverride, LifecycleEvent, ModelDescriptor, ModelState, ResourceRequirement};
pub use payload::Payload;
pub use request::{Batch, ExecutionResult, PaddingInfo, Request, RequestStatus, StatusCell};
pub use traits::{
    BackendPlugin, BatchInput, BatchOutput, CommandChannel, CommandEnvelope, ConfigChange,
    ConfigFeed, ControlCommand, ItemOutput,
};
pub use types::{BackendKind, DeviceKind, HealthStatus, ModelId, Priority, RequestId};
