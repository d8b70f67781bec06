//! Core traits for servemesh components
//!
//! These traits define the seams between the engine and its collaborators:
//! model backends and the external coordination service.

use crate::config::ModelSpec;
use crate::model::ModelDescriptor;
use crate::{BackendKind, HealthStatus, Payload, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result for a single batch item as reported by a backend
pub type ItemOutput = std::result::Result<Payload, String>;

/// Input of one backend call
#[derive(Debug, Clone, PartialEq)]
pub struct BatchInput {
    pub model: String,
    /// Items in batch order, padded when `padded_len` is set
    pub items: Vec<Payload>,
    pub padded_len: Option<usize>,
}

impl BatchInput {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Output of one backend call, one entry per input item in the same order
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput {
    pub items: Vec<ItemOutput>,
}

impl BatchOutput {
    pub fn from_payloads(payloads: Vec<Payload>) -> Self {
        Self {
            items: payloads.into_iter().map(Ok).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.items.iter().filter(|item| item.is_err()).count()
    }
}

/// Capability every model backend provides. One instance serves one model.
#[async_trait]
pub trait BackendPlugin: Send + Sync {
    /// Backend tag this implementation was registered under
    fn kind(&self) -> BackendKind;

    /// Load the model described by `descriptor`
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<()>;

    /// Release everything the backend holds for the model
    async fn unload(&self) -> Result<()>;

    /// Run one batch. Per-item failures are reported inside the output;
    /// an `Err` means the call as a whole failed.
    async fn predict(&self, input: BatchInput) -> Result<BatchOutput>;

    /// Probe backend health
    async fn health_check(&self) -> HealthStatus;
}

/// Lifecycle command delivered by the coordination service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlCommand {
    Register { spec: ModelSpec },
    Load { model: String },
    Unload { model: String },
    Deregister { model: String },
}

/// A command with the identifier used to drop duplicate deliveries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    pub command: ControlCommand,
}

/// At-least-once command channel. Duplicates and reordering are possible.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Next command, or `None` once the channel is closed
    async fn recv(&self) -> Option<CommandEnvelope>;

    /// Acknowledge a processed command
    async fn ack(&self, id: &str) -> Result<()>;
}

/// A key change observed on the configuration/liveness feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub key: String,
    /// `None` when the key was deleted
    pub value: Option<String>,
}

/// Watch-style configuration and liveness feed
#[async_trait]
pub trait ConfigFeed: Send + Sync {
    /// Next change, or `None` once the feed is closed
    async fn next_change(&self) -> Option<ConfigChange>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_output_helpers() {
        let mut output = BatchOutput::from_payloads(vec![Payload::from("a"), Payload::from("b")]);
        assert_eq!(output.len(), 2);
        assert_eq!(output.failed_count(), 0);
        output.items[1] = Err("bad".to_string());
        assert_eq!(output.failed_count(), 1);
    }

    #[test]
    fn test_command_serialization() {
        let envelope = CommandEnvelope {
            id: "cmd-1".to_string(),
            command: ControlCommand::Unload {
                model: "m1".to_string(),
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""op":"unload""#));
        let back: CommandEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
