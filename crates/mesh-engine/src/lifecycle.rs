//! Model load and unload orchestration
//!
//! Ties the registry, resource pool, scheduler and backends together. A load
//! allocates a device share (evicting an idle model if needed), loads the
//! backend, opens the model's queue and starts its former and executor tasks
//! before confirming `Ready`. An unload reverses those steps after draining
//! batches that were already formed.

use crate::coordinator::ExecutionCoordinator;
use crate::registry::ModelRegistry;
use crate::resources::{EvictionCandidate, Evictor, ResourceHandle, ResourcePool};
use crate::scheduler::{BatchFormer, Scheduler};
use async_trait::async_trait;
use dashmap::DashMap;
use mesh_backend::BackendRegistry;
use mesh_core::{
    BackendPlugin, BatchingConfig, DeviceKind, Error, LifecycleEvent, ModelDescriptor, ModelId,
    ModelState, Result,
};
use mesh_metrics::EngineMetrics;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Backend and background tasks of a loaded model
struct ModelRuntime {
    backend: Arc<dyn BackendPlugin>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Drives model loads, unloads and evictions
pub struct LifecycleManager {
    registry: Arc<ModelRegistry>,
    pool: Arc<ResourcePool>,
    scheduler: Arc<Scheduler>,
    coordinator: Arc<ExecutionCoordinator>,
    backends: BackendRegistry,
    batching: BatchingConfig,
    metrics: Arc<EngineMetrics>,
    runtimes: DashMap<ModelId, ModelRuntime>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<ModelRegistry>,
        pool: Arc<ResourcePool>,
        scheduler: Arc<Scheduler>,
        coordinator: Arc<ExecutionCoordinator>,
        backends: BackendRegistry,
        batching: BatchingConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            registry,
            pool,
            scheduler,
            coordinator,
            backends,
            batching,
            metrics,
            runtimes: DashMap::new(),
        }
    }

    /// Register a model whose backend kind is known
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<ModelId> {
        if !self.backends.contains(&descriptor.backend) {
            return Err(Error::validation(format!(
                "no backend registered for kind {}",
                descriptor.backend
            )));
        }
        let name = descriptor.name.clone();
        let id = self.registry.register(descriptor)?;
        self.metrics
            .set_model_state(&name, ModelState::Registered.code());
        Ok(id)
    }

    /// Load a model. Loading a model that is already serving is a no-op.
    pub async fn load(&self, id: &ModelId) -> Result<()> {
        let entry = self.registry.entry(id)?;
        if matches!(entry.state(), ModelState::Ready | ModelState::Degraded) {
            return Ok(());
        }

        self.registry.request_load(id)?;
        let descriptor = entry.descriptor();
        let name = descriptor.name.clone();
        self.publish_state(&name, &ModelState::Loading);
        info!(model = %name, backend = %descriptor.backend, "Loading model");

        let handle = match self
            .pool
            .allocate_with_eviction(
                descriptor.resources.device_kind,
                descriptor.resources.fraction,
                &name,
                self,
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(model = %name, error = %e, "No capacity to load model");
                self.finish_failed_load(id, &name, LifecycleEvent::LoadAborted);
                return Err(e);
            }
        };
        self.publish_utilization();

        let backend = match self.start_backend(&descriptor).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(model = %name, error = %e, "Backend failed to load");
                self.release(&handle);
                self.finish_failed_load(id, &name, LifecycleEvent::LoadFailed(e.to_string()));
                return Err(e);
            }
        };

        self.registry.set_allocation(id, Some(handle.clone()))?;
        self.start_runtime(id, &descriptor, Arc::clone(&backend))?;

        match self.registry.confirm_ready(id) {
            Ok(_) => {
                self.publish_state(&name, &ModelState::Ready);
                info!(
                    model = %name,
                    device = %handle.device_id,
                    fraction = handle.fraction,
                    "Model ready"
                );
                Ok(())
            }
            Err(e) => {
                // An unload raced with the load; finish it on its behalf
                debug!(model = %name, error = %e, "Load superseded by unload");
                self.teardown(id, &name).await;
                self.complete_unload(id, &name)?;
                Err(Error::model_not_ready(name, ModelState::Unloaded))
            }
        }
    }

    /// Unload a model and release its resources. Idempotent.
    pub async fn unload(&self, id: &ModelId) -> Result<()> {
        let Some(transition) = self.registry.request_unload(id)? else {
            return Ok(());
        };
        let name = self.registry.entry(id)?.name();
        self.publish_state(&name, &ModelState::Unloading);

        match transition.from {
            ModelState::Registered => {
                self.complete_unload(id, &name)?;
            }
            // The loading task notices the unload when it tries to confirm
            ModelState::Loading => {}
            _ => {
                info!(model = %name, "Unloading model");
                self.teardown(id, &name).await;
                self.complete_unload(id, &name)?;
                info!(model = %name, "Model unloaded");
            }
        }
        Ok(())
    }

    /// Unload if needed, then remove the model from the registry
    pub async fn deregister(&self, id: &ModelId) -> Result<ModelDescriptor> {
        if self.registry.entry(id)?.state().holds_resources() {
            self.unload(id).await?;
        }
        let descriptor = self.registry.deregister(id)?;
        self.metrics.forget_model(&descriptor.name);
        Ok(descriptor)
    }

    /// Backend serving a loaded model
    pub fn backend(&self, id: &ModelId) -> Option<Arc<dyn BackendPlugin>> {
        self.runtimes
            .get(id)
            .map(|runtime| Arc::clone(&runtime.backend))
    }

    /// Models that currently have a running backend
    pub fn loaded_models(&self) -> Vec<ModelId> {
        self.runtimes.iter().map(|r| r.key().clone()).collect()
    }

    /// Unload every model, e.g. at shutdown
    pub async fn unload_all(&self) {
        for (id, _) in self.registry.entries() {
            if let Err(e) = self.unload(&id).await {
                warn!(model = %id, error = %e, "Failed to unload model");
            }
        }
    }

    async fn start_backend(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn BackendPlugin>> {
        let backend = self.backends.create(descriptor)?;
        backend.load(descriptor).await?;
        Ok(backend)
    }

    fn start_runtime(
        &self,
        id: &ModelId,
        descriptor: &ModelDescriptor,
        backend: Arc<dyn BackendPlugin>,
    ) -> Result<()> {
        let batching = self.batching.resolve(descriptor);
        let (batch_tx, batch_rx) = mpsc::channel(batching.max_inflight_batches);
        let (stop_tx, stop_rx) = watch::channel(false);
        let entry = self.registry.entry(id)?;
        let queue = self.scheduler.open_queue(&descriptor.name, batching);

        let former = BatchFormer::new(
            queue,
            self.registry.subscribe(id)?,
            batch_tx,
            stop_rx,
            Arc::clone(&self.metrics),
            entry.stats_handle(),
        )
        .spawn();
        let executor = self
            .coordinator
            .spawn_executor(id.clone(), Arc::clone(&backend), batch_rx);

        self.runtimes.insert(
            id.clone(),
            ModelRuntime {
                backend,
                stop_tx,
                tasks: vec![former, executor],
            },
        );
        Ok(())
    }

    /// Stop serving: fail queued requests, drain formed batches, unload the
    /// backend and release the allocation
    async fn teardown(&self, id: &ModelId, name: &str) {
        let pending = self.scheduler.close_queue(name);
        if !pending.is_empty() {
            debug!(model = name, count = pending.len(), "Failing queued requests");
        }
        for mut request in pending {
            request.fail(Error::model_not_ready(name, ModelState::Unloading));
        }

        if let Some((_, runtime)) = self.runtimes.remove(id) {
            runtime.stop_tx.send_replace(true);
            for task in runtime.tasks {
                if let Err(e) = task.await {
                    warn!(model = name, error = %e, "Model task ended abnormally");
                }
            }
            if let Err(e) = runtime.backend.unload().await {
                warn!(model = name, error = %e, "Backend unload failed");
            }
        }

        if let Ok(Some(handle)) = self.registry.take_allocation(id) {
            self.release(&handle);
        }
    }

    fn complete_unload(&self, id: &ModelId, name: &str) -> Result<()> {
        self.registry.complete_unload(id)?;
        self.publish_state(name, &ModelState::Unloaded);
        Ok(())
    }

    /// Move a load that did not finish out of `Loading`, or complete an
    /// unload that was requested in the meantime
    fn finish_failed_load(&self, id: &ModelId, name: &str, event: LifecycleEvent) {
        let result = match &event {
            LifecycleEvent::LoadFailed(reason) => self.registry.fail_load(id, reason.clone()),
            _ => self.registry.abort_load(id),
        };
        match result {
            Ok(transition) => self.publish_state(name, &transition.to),
            Err(_) => {
                if let Err(e) = self.complete_unload(id, name) {
                    warn!(model = name, error = %e, "Could not settle failed load");
                }
            }
        }
    }

    fn release(&self, handle: &ResourceHandle) {
        self.pool.release(handle);
        self.publish_utilization();
    }

    fn publish_state(&self, name: &str, state: &ModelState) {
        self.metrics.set_model_state(name, state.code());
    }

    fn publish_utilization(&self) {
        for device in self.pool.device_usage() {
            self.metrics.set_device_utilization(
                &device.id,
                &device.kind.to_string(),
                device.utilization(),
            );
        }
    }
}

#[async_trait]
impl Evictor for LifecycleManager {
    /// Ready models on `kind` devices with nothing queued or executing
    fn candidates(&self, kind: DeviceKind) -> Vec<EvictionCandidate> {
        self.registry
            .entries()
            .into_iter()
            .filter_map(|(_, entry)| {
                let descriptor = entry.descriptor();
                if !descriptor.state.is_ready() || entry.in_flight() > 0 {
                    return None;
                }
                if self.scheduler.depth(&descriptor.name) > 0 {
                    return None;
                }
                let handle = entry.allocation()?;
                (handle.device_kind == kind).then(|| EvictionCandidate {
                    model: descriptor.name.clone(),
                    device_id: handle.device_id,
                    fraction: handle.fraction,
                    last_access: entry.last_access(),
                    priority_class: descriptor.priority_class,
                })
            })
            .collect()
    }

    async fn evict(&self, candidate: &EvictionCandidate) -> Result<()> {
        let entry = self.registry.entry_by_name(&candidate.model)?;
        if !entry.state().is_ready() || entry.in_flight() > 0 {
            return Err(Error::resource_exhausted(format!(
                "{} is no longer idle",
                candidate.model
            )));
        }
        let id = entry.descriptor().id.clone();
        self.unload(&id).await?;
        self.metrics.record_eviction(&candidate.device_id);
        Ok(())
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("loaded", &self.runtimes.len())
            .field("backends", &self.backends)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_backend::MockBackend;
    use mesh_core::{BackendKind, DeviceConfig, ExecutionConfig, Payload, Priority, Request};

    struct Fixture {
        manager: LifecycleManager,
        registry: Arc<ModelRegistry>,
        pool: Arc<ResourcePool>,
        scheduler: Arc<Scheduler>,
        mock: MockBackend,
    }

    fn fixture(eviction_enabled: bool) -> Fixture {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let registry = Arc::new(ModelRegistry::default());
        let pool = Arc::new(ResourcePool::new(
            &[DeviceConfig::new("gpu0", DeviceKind::Gpu)],
            eviction_enabled,
        ));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&metrics)));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&scheduler),
            ExecutionConfig::default(),
            Arc::clone(&metrics),
        ));

        let mock = MockBackend::new_default();
        let mut backends = BackendRegistry::with_builtin();
        let shared = mock.clone();
        backends.register(BackendKind::Mock, move |_| {
            Ok(Arc::new(shared.clone()) as Arc<dyn BackendPlugin>)
        });

        let manager = LifecycleManager::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&scheduler),
            coordinator,
            backends,
            BatchingConfig::default(),
            metrics,
        );
        Fixture {
            manager,
            registry,
            pool,
            scheduler,
            mock,
        }
    }

    fn gpu_model(name: &str, fraction: f64) -> ModelDescriptor {
        ModelDescriptor::new(name, BackendKind::Mock, "none").with_resources(DeviceKind::Gpu, fraction)
    }

    #[tokio::test]
    async fn test_load_and_unload() {
        let f = fixture(false);
        let id = f.manager.register(gpu_model("m1", 0.6)).unwrap();

        f.manager.load(&id).await.unwrap();
        assert_eq!(f.registry.get_status(&id).unwrap().state, ModelState::Ready);
        assert!(f.mock.is_loaded());
        assert!(f.scheduler.queue("m1").is_some());
        assert!((f.pool.device("gpu0").unwrap().allocated - 0.6).abs() < 1e-9);

        // Loading again is a no-op
        f.manager.load(&id).await.unwrap();

        f.manager.unload(&id).await.unwrap();
        assert_eq!(f.registry.get_status(&id).unwrap().state, ModelState::Unloaded);
        assert!(!f.mock.is_loaded());
        assert!(f.scheduler.queue("m1").is_none());
        assert_eq!(f.pool.device("gpu0").unwrap().allocated, 0.0);
        assert!(f.manager.backend(&id).is_none());

        let version = f.registry.get_status(&id).unwrap().version;
        f.manager.unload(&id).await.unwrap();
        assert_eq!(f.registry.get_status(&id).unwrap().version, version);
    }

    #[tokio::test]
    async fn test_unknown_backend_kind_is_rejected() {
        let f = fixture(false);
        let descriptor = ModelDescriptor::new("m1", BackendKind::Onnx, "none");
        assert!(matches!(
            f.manager.register(descriptor),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_exhaustion_without_idle_models() {
        let f = fixture(true);
        let a = f.manager.register(gpu_model("a", 0.6)).unwrap();
        let b = f.manager.register(gpu_model("b", 0.6)).unwrap();
        f.manager.load(&a).await.unwrap();

        // Keep `a` busy so it is not an eviction candidate
        f.registry.begin_execution(&a, 1).unwrap();
        let err = f.manager.load(&b).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(f.registry.get_status(&b).unwrap().state, ModelState::Unloaded);
        assert_eq!(f.registry.get_status(&a).unwrap().state, ModelState::Ready);
        f.registry.end_execution(&a, 1).unwrap();
    }

    #[tokio::test]
    async fn test_idle_model_is_evicted() {
        let f = fixture(true);
        let a = f.manager.register(gpu_model("a", 0.6)).unwrap();
        let b = f.manager.register(gpu_model("b", 0.6)).unwrap();
        f.manager.load(&a).await.unwrap();

        f.manager.load(&b).await.unwrap();
        assert_eq!(f.registry.get_status(&a).unwrap().state, ModelState::Unloaded);
        assert_eq!(f.registry.get_status(&b).unwrap().state, ModelState::Ready);
        assert_eq!(
            f.pool.device("gpu0").unwrap().owners,
            vec!["b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_backend_load_failure_marks_failed() {
        let f = fixture(false);
        f.mock.fail_load("weights missing");
        let id = f.manager.register(gpu_model("m1", 0.5)).unwrap();

        assert!(f.manager.load(&id).await.is_err());
        let status = f.registry.get_status(&id).unwrap();
        assert!(matches!(status.state, ModelState::Failed { .. }));
        assert_eq!(f.pool.device("gpu0").unwrap().allocated, 0.0);

        // Failed models can be removed but not unloaded
        f.manager.unload(&id).await.unwrap();
        f.manager.deregister(&id).await.unwrap();
        assert!(f.registry.lookup("m1").is_none());
    }

    #[tokio::test]
    async fn test_unload_fails_queued_requests() {
        let f = fixture(false);
        let id = f.manager.register(gpu_model("m1", 0.5)).unwrap();
        f.manager.load(&id).await.unwrap();

        let queue = f.scheduler.queue("m1").unwrap();
        let (request, rx) = Request::new("m1", Payload::from("x"), Priority::Normal, None);
        // Still waiting for max_wait when the unload starts
        queue.push(request).unwrap();
        f.manager.unload(&id).await.unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err.error, Error::ModelNotReady { .. }));
        assert_eq!(f.registry.get_status(&id).unwrap().state, ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_deregister_loaded_model() {
        let f = fixture(false);
        let id = f.manager.register(gpu_model("m1", 0.5)).unwrap();
        f.manager.load(&id).await.unwrap();

        let descriptor = f.manager.deregister(&id).await.unwrap();
        assert_eq!(descriptor.name, "m1");
        assert_eq!(f.pool.device("gpu0").unwrap().allocated, 0.0);
    }

    #[tokio::test]
    async fn test_reload_after_unload() {
        let f = fixture(false);
        let id = f.manager.register(gpu_model("m1", 0.5)).unwrap();
        f.manager.load(&id).await.unwrap();
        f.manager.unload(&id).await.unwrap();
        f.manager.load(&id).await.unwrap();
        assert_eq!(f.registry.get_status(&id).unwrap().state, ModelState::Ready);
    }
}
