//! Serving engine facade

use crate::control::ControlApplier;
use crate::coordinator::ExecutionCoordinator;
use crate::health::HealthMonitor;
use crate::lifecycle::LifecycleManager;
use crate::registry::{HealthThresholds, ModelRegistry};
use crate::resources::{DeviceSnapshot, ResourceHandle, ResourcePool};
use crate::router::{AdmissionRouter, RequestHandle};
use crate::scheduler::Scheduler;
use crate::stats::ModelStatsSnapshot;
use mesh_backend::BackendRegistry;
use mesh_core::{
    CommandChannel, CommandEnvelope, Config, ConfigChange, ConfigFeed, Error, HealthStatus,
    ModelDescriptor, ModelId, ModelState, Payload, Priority, Result,
};
use mesh_metrics::{EngineMetrics, Readiness};
use parking_lot::Mutex;
use prometheus::Registry;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Status of one model as reported to operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatusReport {
    pub name: String,
    pub id: ModelId,
    pub state: ModelState,
    pub version: u64,
    pub queue_depth: usize,
    pub resource_usage: Option<ResourceHandle>,
    pub in_flight: usize,
    pub stats: ModelStatsSnapshot,
}

/// Engine-wide health: healthy while at least one model serves
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub ready: usize,
    pub degraded: usize,
    pub loading: usize,
    pub models: Vec<ModelHealth>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelHealth {
    pub name: String,
    pub state: ModelState,
}

/// The assembled serving core
#[derive(Debug)]
pub struct Engine {
    config: Config,
    registry: Arc<ModelRegistry>,
    pool: Arc<ResourcePool>,
    scheduler: Arc<Scheduler>,
    lifecycle: Arc<LifecycleManager>,
    router: AdmissionRouter,
    health: Arc<HealthMonitor>,
    control: Arc<ControlApplier>,
    metrics_registry: Registry,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build every component, register configured models and load the
    /// ones marked `autoload`
    pub async fn start(config: Config, backends: BackendRegistry) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            node = %config.node.name,
            devices = config.resources.devices.len(),
            models = config.models.len(),
            "Starting serving engine"
        );

        let metrics_registry = Registry::new();
        let metrics = Arc::new(EngineMetrics::new().map_err(|e| Error::internal(e.to_string()))?);
        metrics
            .register(&metrics_registry)
            .map_err(|e| Error::internal(e.to_string()))?;

        let registry = Arc::new(ModelRegistry::new(HealthThresholds::from_config(
            &config.health,
            &config.execution,
        )));
        let pool = Arc::new(ResourcePool::new(
            &config.resources.devices,
            config.resources.eviction_enabled,
        ));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&metrics)));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&scheduler),
            config.execution.clone(),
            Arc::clone(&metrics),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&scheduler),
            coordinator,
            backends,
            config.batching.clone(),
            Arc::clone(&metrics),
        ));
        let router = AdmissionRouter::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            config.admission.clone(),
            Arc::clone(&metrics),
        );
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            config.health.clone(),
            metrics,
        ));
        let control = Arc::new(ControlApplier::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&lifecycle),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = Arc::new(Self {
            config,
            registry,
            pool,
            scheduler,
            lifecycle,
            router,
            health,
            control,
            metrics_registry,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        for spec in &engine.config.models {
            let id = engine.lifecycle.register(spec.to_descriptor())?;
            if spec.autoload {
                if let Err(e) = engine.lifecycle.load(&id).await {
                    warn!(model = %spec.name, error = %e, "Failed to load model at startup");
                }
            }
        }

        if engine.config.health.enabled {
            let handle = Arc::clone(&engine.health).spawn(shutdown_rx);
            engine.tasks.lock().push(handle);
        }

        info!("Serving engine started");
        Ok(engine)
    }

    /// Admit an inference request
    pub fn submit(
        &self,
        model: &str,
        payload: Payload,
        priority: Option<Priority>,
        deadline: Option<Instant>,
    ) -> Result<RequestHandle> {
        self.router.submit(model, payload, priority, deadline)
    }

    /// Admit several inputs for one model; either all are queued or none
    pub fn submit_many(
        &self,
        model: &str,
        payloads: Vec<Payload>,
        priority: Option<Priority>,
        deadline: Option<Instant>,
    ) -> Result<Vec<RequestHandle>> {
        self.router.submit_many(model, payloads, priority, deadline)
    }

    pub fn get_model_status(&self, name: &str) -> Result<ModelStatusReport> {
        let entry = self.registry.entry_by_name(name)?;
        let descriptor = entry.descriptor();
        Ok(ModelStatusReport {
            name: descriptor.name.clone(),
            id: descriptor.id.clone(),
            state: descriptor.state.clone(),
            version: descriptor.version,
            queue_depth: self.scheduler.depth(&descriptor.name),
            resource_usage: entry.allocation(),
            in_flight: entry.in_flight(),
            stats: entry.stats().snapshot(),
        })
    }

    pub fn register_model(&self, descriptor: ModelDescriptor) -> Result<ModelId> {
        self.lifecycle.register(descriptor)
    }

    pub async fn load_model(&self, name: &str) -> Result<()> {
        let id = self.resolve(name)?;
        self.lifecycle.load(&id).await
    }

    /// Unload a model by id. Unknown ids are a no-op.
    pub async fn request_unload(&self, id: &ModelId) -> Result<()> {
        match self.lifecycle.unload(id).await {
            Err(Error::ModelNotFound(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn unload_model(&self, name: &str) -> Result<()> {
        let id = self.resolve(name)?;
        self.lifecycle.unload(&id).await
    }

    pub async fn deregister_model(&self, name: &str) -> Result<ModelDescriptor> {
        let id = self.resolve(name)?;
        self.lifecycle.deregister(&id).await
    }

    pub fn list_models(&self) -> Vec<Arc<ModelDescriptor>> {
        self.registry.list()
    }

    pub fn device_usage(&self) -> Vec<DeviceSnapshot> {
        self.pool.device_usage()
    }

    /// Summarize every model's lifecycle state
    pub fn health(&self) -> EngineHealth {
        let models: Vec<ModelHealth> = self
            .registry
            .list()
            .iter()
            .map(|descriptor| ModelHealth {
                name: descriptor.name.clone(),
                state: descriptor.state.clone(),
            })
            .collect();
        let count = |wanted: fn(&ModelState) -> bool| {
            models.iter().filter(|m| wanted(&m.state)).count()
        };
        let ready = count(ModelState::is_ready);
        let degraded = count(|state| *state == ModelState::Degraded);
        let loading = count(|state| *state == ModelState::Loading);

        let status = if *self.shutdown_tx.borrow() {
            HealthStatus::Unhealthy("shutting down".to_string())
        } else if models.is_empty() {
            HealthStatus::Unknown
        } else if ready > 0 {
            HealthStatus::Healthy
        } else if loading > 0 {
            HealthStatus::Starting
        } else {
            HealthStatus::Unhealthy("no model is ready".to_string())
        };

        EngineHealth {
            status,
            ready,
            degraded,
            loading,
            models,
        }
    }

    /// Run one health probe for a model now
    pub async fn check_health(&self, name: &str) -> Result<ModelState> {
        let id = self.resolve(name)?;
        self.health.check_now(&id).await?;
        Ok(self.registry.entry(&id)?.state())
    }

    pub async fn apply_command(&self, envelope: &CommandEnvelope) -> Result<()> {
        self.control.apply_command(envelope).await
    }

    pub async fn apply_config_change(&self, change: &ConfigChange) -> Result<()> {
        self.control.apply_change(change).await
    }

    /// Consume a command channel until shutdown
    pub fn spawn_control(&self, channel: Arc<dyn CommandChannel>) {
        let handle = self
            .control
            .spawn_commands(channel, self.shutdown_tx.subscribe());
        self.tasks.lock().push(handle);
    }

    /// Consume a configuration feed until shutdown
    pub fn spawn_config_feed(&self, feed: Arc<dyn ConfigFeed>) {
        let handle = self.control.spawn_feed(feed, self.shutdown_tx.subscribe());
        self.tasks.lock().push(handle);
    }

    /// Registry holding the engine's collectors
    pub fn metrics_registry(&self) -> &Registry {
        &self.metrics_registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop background tasks and unload every model
    pub async fn shutdown(&self) {
        info!("Shutting down serving engine");
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.lifecycle.unload_all().await;
        info!("Serving engine stopped");
    }

    fn resolve(&self, name: &str) -> Result<ModelId> {
        self.registry
            .lookup(name)
            .ok_or_else(|| Error::model_not_found(name))
    }
}

impl Readiness for Engine {
    fn is_ready(&self) -> bool {
        self.health().status.is_healthy()
    }

    fn describe(&self) -> String {
        serde_json::to_string(&self.health()).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to serialize engine health");
            String::from("{}")
        })
    }
}
