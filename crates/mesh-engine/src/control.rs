//! Coordination service integration
//!
//! Applies lifecycle commands from an at-least-once channel and key changes
//! from a watch-style configuration feed. Every command is applied against
//! the current registry state, so duplicates and reordering are harmless:
//! loading a loaded model or unloading an unknown one is a no-op.
//!
//! Recognised configuration keys:
//!
//! - `devices/<id>/live`: `true` or `false`; deleting the key marks the device dead
//! - `models/<name>/options/<key>`: JSON value merged into the model options
//! - `models/<name>/desired`: `loaded` or `unloaded`

use crate::lifecycle::LifecycleManager;
use crate::registry::ModelRegistry;
use crate::resources::ResourcePool;
use async_trait::async_trait;
use mesh_core::{
    CommandChannel, CommandEnvelope, ConfigChange, ConfigFeed, ControlCommand, Error, ModelState,
    Result,
};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Command ids remembered for duplicate suppression
const SEEN_COMMANDS_CAPACITY: usize = 1024;

/// Bounded set of recently applied command ids
#[derive(Debug, Default)]
struct SeenCommands {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenCommands {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > SEEN_COMMANDS_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Applies coordination service input to the engine
#[derive(Debug)]
pub struct ControlApplier {
    registry: Arc<ModelRegistry>,
    pool: Arc<ResourcePool>,
    lifecycle: Arc<LifecycleManager>,
    seen: Mutex<SeenCommands>,
}

impl ControlApplier {
    pub fn new(
        registry: Arc<ModelRegistry>,
        pool: Arc<ResourcePool>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            registry,
            pool,
            lifecycle,
            seen: Mutex::new(SeenCommands::default()),
        }
    }

    /// Apply one command. Redelivered ids are ignored.
    pub async fn apply_command(&self, envelope: &CommandEnvelope) -> Result<()> {
        if self.seen.lock().contains(&envelope.id) {
            debug!(command = %envelope.id, "Ignoring duplicate command");
            return Ok(());
        }

        match &envelope.command {
            ControlCommand::Register { spec } => {
                if self.registry.lookup(&spec.name).is_none() {
                    let id = self.lifecycle.register(spec.to_descriptor())?;
                    if spec.autoload {
                        self.lifecycle.load(&id).await?;
                    }
                }
            }
            ControlCommand::Load { model } => {
                let id = self
                    .registry
                    .lookup(model)
                    .ok_or_else(|| Error::model_not_found(model))?;
                let state = self.registry.entry(&id)?.state();
                if !matches!(
                    state,
                    ModelState::Loading | ModelState::Ready | ModelState::Degraded
                ) {
                    self.lifecycle.load(&id).await?;
                }
            }
            ControlCommand::Unload { model } => {
                if let Some(id) = self.registry.lookup(model) {
                    self.lifecycle.unload(&id).await?;
                }
            }
            ControlCommand::Deregister { model } => {
                if let Some(id) = self.registry.lookup(model) {
                    self.lifecycle.deregister(&id).await?;
                }
            }
        }

        info!(command = %envelope.id, op = ?envelope.command, "Applied control command");
        self.seen.lock().insert(envelope.id.clone());
        Ok(())
    }

    /// Apply one configuration or liveness change
    pub async fn apply_change(&self, change: &ConfigChange) -> Result<()> {
        let parts: Vec<&str> = change.key.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            ["devices", device, "live"] => {
                let live = match change.value.as_deref() {
                    None => false,
                    Some(value) => value.trim().parse::<bool>().map_err(|_| {
                        Error::validation(format!("invalid liveness value {:?}", value))
                    })?,
                };
                self.pool.set_device_live(device, live)
            }
            ["models", model, "options", key] => {
                let Some(raw) = change.value.as_deref() else {
                    debug!(model, key, "Ignoring deleted model option");
                    return Ok(());
                };
                let id = self
                    .registry
                    .lookup(model)
                    .ok_or_else(|| Error::model_not_found(*model))?;
                let value = serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
                self.registry.update_option(&id, key, value)?;
                Ok(())
            }
            ["models", model, "desired"] => {
                let Some(id) = self.registry.lookup(model) else {
                    debug!(model, "Desired state for unknown model");
                    return Ok(());
                };
                match change.value.as_deref().map(str::trim) {
                    Some("loaded") => {
                        if !self.registry.entry(&id)?.state().holds_resources() {
                            self.lifecycle.load(&id).await?;
                        }
                        Ok(())
                    }
                    Some("unloaded") | None => self.lifecycle.unload(&id).await,
                    Some(other) => Err(Error::validation(format!(
                        "unknown desired state {:?} for {}",
                        other, model
                    ))),
                }
            }
            _ => {
                debug!(key = %change.key, "Ignoring unrecognised configuration key");
                Ok(())
            }
        }
    }

    /// Consume commands until the channel closes or `shutdown` is set.
    ///
    /// Commands that fail with a retryable error are left unacknowledged so
    /// the channel redelivers them.
    pub fn spawn_commands(
        self: &Arc<Self>,
        channel: Arc<dyn CommandChannel>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let applier = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    envelope = channel.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                let result = applier.apply_command(&envelope).await;
                if let Err(e) = &result {
                    warn!(command = %envelope.id, error = %e, "Control command failed");
                }
                let retry = matches!(&result, Err(e) if e.is_retryable());
                if !retry {
                    if let Err(e) = channel.ack(&envelope.id).await {
                        warn!(command = %envelope.id, error = %e, "Failed to acknowledge command");
                    }
                }
            }
            debug!("Control command loop stopped");
        })
    }

    /// Consume configuration changes until the feed closes or `shutdown` is set
    pub fn spawn_feed(
        self: &Arc<Self>,
        feed: Arc<dyn ConfigFeed>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let applier = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    change = feed.next_change() => match change {
                        Some(change) => change,
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };
                if let Err(e) = applier.apply_change(&change).await {
                    warn!(key = %change.key, error = %e, "Configuration change failed");
                }
            }
            debug!("Configuration feed loop stopped");
        })
    }
}

/// Command channel backed by an in-process queue
#[derive(Debug)]
pub struct InMemoryCommandChannel {
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<CommandEnvelope>>,
    acked: Mutex<Vec<String>>,
}

impl InMemoryCommandChannel {
    /// Create the channel and the sender used to publish commands
    pub fn new() -> (Self, mpsc::UnboundedSender<CommandEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            receiver: tokio::sync::Mutex::new(rx),
            acked: Mutex::new(Vec::new()),
        };
        (channel, tx)
    }

    /// Ids acknowledged so far, in order
    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().clone()
    }
}

#[async_trait]
impl CommandChannel for InMemoryCommandChannel {
    async fn recv(&self) -> Option<CommandEnvelope> {
        self.receiver.lock().await.recv().await
    }

    async fn ack(&self, id: &str) -> Result<()> {
        self.acked.lock().push(id.to_string());
        Ok(())
    }
}

/// Configuration feed backed by an in-process queue
#[derive(Debug)]
pub struct InMemoryConfigFeed {
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConfigChange>>,
}

impl InMemoryConfigFeed {
    pub fn new() -> (Self, mpsc::UnboundedSender<ConfigChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                receiver: tokio::sync::Mutex::new(rx),
            },
            tx,
        )
    }
}

#[async_trait]
impl ConfigFeed for InMemoryConfigFeed {
    async fn next_change(&self) -> Option<ConfigChange> {
        self.receiver.lock().await.recv().await
    }
}
