//! # mesh-backend
//!
//! Model backends for servemesh.
//!
//! This crate provides:
//! - A static [`BackendRegistry`] that maps a [`BackendKind`] tag to a factory
//! - The `echo` backend, which returns its input unchanged
//! - The `mock` backend, with scriptable latency, per-item failures, whole-call
//!   failures and health, for tests and local development
//!
//! Backends are selected when a model is registered. There is no dynamic code
//! loading: new kinds are added by registering another factory at startup.
//!
//! [`BackendKind`]: mesh_core::BackendKind

pub mod echo;
pub mod mock;
pub mod registry;

pub use echo::EchoBackend;
pub use mock::{MockBackend, MockBackendConfig};
pub use registry::{BackendFactory, BackendRegistry};
