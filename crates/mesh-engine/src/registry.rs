//! Model registry
//!
//! Authoritative lifecycle state for every known model. Each entry keeps its
//! descriptor behind an [`ArcSwap`], so reads are lock-free snapshots and
//! every transition is a compare-and-swap against the snapshot it was computed
//! from. A writer that loses the race re-evaluates the event against the new
//! state, which is what makes concurrent `request_load` calls mutually
//! exclusive: only the first sees `Registered`.

use crate::resources::ResourceHandle;
use crate::stats::ModelStats;
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use mesh_core::{
    Error, ExecutionConfig, HealthConfig, LifecycleEvent, ModelDescriptor, ModelId, ModelState,
    Result,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where a health observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSource {
    /// Periodic or on-demand backend health check
    Probe,
    /// Outcome of a whole backend call
    Execution,
}

/// One health observation for a model
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub source: HealthSource,
    pub healthy: bool,
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn probe(healthy: bool) -> Self {
        Self {
            source: HealthSource::Probe,
            healthy,
            detail: None,
        }
    }

    pub fn execution(healthy: bool) -> Self {
        Self {
            source: HealthSource::Execution,
            healthy,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Consecutive-observation thresholds for degrading and recovering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub probe_failures: u32,
    pub probe_successes: u32,
    pub execution_failures: u32,
}

impl HealthThresholds {
    pub fn from_config(health: &HealthConfig, execution: &ExecutionConfig) -> Self {
        Self {
            probe_failures: health.failure_threshold.max(1),
            probe_successes: health.success_threshold.max(1),
            execution_failures: execution.degrade_after_failures.max(1),
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default(), &ExecutionConfig::default())
    }
}

/// Registry record for one model
#[derive(Debug)]
pub struct ModelEntry {
    descriptor: ArcSwap<ModelDescriptor>,
    state_tx: watch::Sender<ModelState>,
    in_flight: AtomicUsize,
    last_access: Mutex<Instant>,
    allocation: Mutex<Option<ResourceHandle>>,
    probe_failures: AtomicU32,
    probe_successes: AtomicU32,
    execution_failures: AtomicU32,
    stats: Arc<ModelStats>,
}

impl ModelEntry {
    fn new(descriptor: ModelDescriptor) -> Self {
        let (state_tx, _) = watch::channel(descriptor.state.clone());
        Self {
            descriptor: ArcSwap::from_pointee(descriptor),
            state_tx,
            in_flight: AtomicUsize::new(0),
            last_access: Mutex::new(Instant::now()),
            allocation: Mutex::new(None),
            probe_failures: AtomicU32::new(0),
            probe_successes: AtomicU32::new(0),
            execution_failures: AtomicU32::new(0),
            stats: Arc::new(ModelStats::new()),
        }
    }

    /// Lock-free snapshot of the descriptor
    pub fn descriptor(&self) -> Arc<ModelDescriptor> {
        self.descriptor.load_full()
    }

    pub fn state(&self) -> ModelState {
        self.descriptor.load().state.clone()
    }

    pub fn name(&self) -> String {
        self.descriptor.load().name.clone()
    }

    /// Requests currently inside a backend call
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    pub fn allocation(&self) -> Option<ResourceHandle> {
        self.allocation.lock().clone()
    }

    pub fn stats(&self) -> &ModelStats {
        &self.stats
    }

    pub fn stats_handle(&self) -> Arc<ModelStats> {
        Arc::clone(&self.stats)
    }
}

/// Result of a successful lifecycle transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: ModelState,
    pub to: ModelState,
    pub version: u64,
}

/// Authoritative lifecycle state for every known model
#[derive(Debug)]
pub struct ModelRegistry {
    models: DashMap<ModelId, Arc<ModelEntry>>,
    names: DashMap<String, ModelId>,
    thresholds: HealthThresholds,
}

impl ModelRegistry {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            models: DashMap::new(),
            names: DashMap::new(),
            thresholds,
        }
    }

    /// Register a model; fails with `DuplicateModel` if the name is taken
    pub fn register(&self, mut descriptor: ModelDescriptor) -> Result<ModelId> {
        descriptor.validate()?;
        descriptor.state = ModelState::Registered;
        descriptor.version = 0;

        match self.names.entry(descriptor.name.clone()) {
            Entry::Occupied(_) => Err(Error::duplicate_model(descriptor.name)),
            Entry::Vacant(slot) => {
                let id = descriptor.id.clone();
                info!(model = %descriptor.name, id = %id, backend = %descriptor.backend, "Registered model");
                self.models
                    .insert(id.clone(), Arc::new(ModelEntry::new(descriptor)));
                slot.insert(id.clone());
                Ok(id)
            }
        }
    }

    /// Resolve a model name to its id
    pub fn lookup(&self, name: &str) -> Option<ModelId> {
        self.names.get(name).map(|id| id.value().clone())
    }

    pub fn entry(&self, id: &ModelId) -> Result<Arc<ModelEntry>> {
        self.models
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::model_not_found(id.to_string()))
    }

    /// Map guard for a model. Deregistration needs the shard write lock, so
    /// a transition made under this guard can not race a removal.
    fn pinned(&self, id: &ModelId) -> Result<Ref<'_, ModelId, Arc<ModelEntry>>> {
        self.models
            .get(id)
            .ok_or_else(|| Error::model_not_found(id.to_string()))
    }

    pub fn entry_by_name(&self, name: &str) -> Result<Arc<ModelEntry>> {
        let id = self
            .lookup(name)
            .ok_or_else(|| Error::model_not_found(name))?;
        self.entry(&id)
    }

    /// Pure read of a model's descriptor, never waits for writers
    pub fn get_status(&self, id: &ModelId) -> Result<Arc<ModelDescriptor>> {
        Ok(self.entry(id)?.descriptor())
    }

    /// Watch a model's lifecycle state
    pub fn subscribe(&self, id: &ModelId) -> Result<watch::Receiver<ModelState>> {
        Ok(self.entry(id)?.state_tx.subscribe())
    }

    pub fn list(&self) -> Vec<Arc<ModelDescriptor>> {
        let mut models: Vec<_> = self
            .models
            .iter()
            .map(|entry| entry.value().descriptor())
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    pub fn entries(&self) -> Vec<(ModelId, Arc<ModelEntry>)> {
        self.models
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// `Registered`/`Unloaded` to `Loading`; at most one caller wins
    pub fn request_load(&self, id: &ModelId) -> Result<Transition> {
        self.apply(id, LifecycleEvent::LoadRequested)
    }

    /// `Loading` to `Ready`
    pub fn confirm_ready(&self, id: &ModelId) -> Result<Transition> {
        let transition = self.apply(id, LifecycleEvent::LoadSucceeded)?;
        let entry = self.entry(id)?;
        entry.probe_failures.store(0, Ordering::Release);
        entry.probe_successes.store(0, Ordering::Release);
        entry.execution_failures.store(0, Ordering::Release);
        entry.touch();
        Ok(transition)
    }

    /// `Loading` to `Failed`
    pub fn fail_load(&self, id: &ModelId, reason: impl Into<String>) -> Result<Transition> {
        self.apply(id, LifecycleEvent::LoadFailed(reason.into()))
    }

    /// `Loading` back to `Unloaded` when the load could not start
    pub fn abort_load(&self, id: &ModelId) -> Result<Transition> {
        self.apply(id, LifecycleEvent::LoadAborted)
    }

    /// Move to `Unloading`. Returns `None` when there is nothing to unload:
    /// the model is already `Unloaded` (idempotent) or `Failed`.
    pub fn request_unload(&self, id: &ModelId) -> Result<Option<Transition>> {
        let entry = self.pinned(id)?;
        loop {
            let current = entry.descriptor();
            match current.state {
                ModelState::Unloaded | ModelState::Failed { .. } => return Ok(None),
                // Another caller is already unloading
                ModelState::Unloading => return Ok(None),
                _ => {}
            }
            match self.try_apply(&entry, &current, &LifecycleEvent::UnloadRequested)? {
                Some(transition) => return Ok(Some(transition)),
                None => continue,
            }
        }
    }

    /// `Unloading` to `Unloaded`
    pub fn complete_unload(&self, id: &ModelId) -> Result<Transition> {
        self.apply(id, LifecycleEvent::UnloadCompleted)
    }

    /// Optimistic transition that fails with `VersionConflict` instead of retrying
    pub fn compare_and_set(
        &self,
        id: &ModelId,
        expected_version: u64,
        event: LifecycleEvent,
    ) -> Result<Transition> {
        let entry = self.pinned(id)?;
        let current = entry.descriptor();
        if current.version != expected_version {
            return Err(Error::version_conflict(format!(
                "{} is at version {}, expected {}",
                current.name, current.version, expected_version
            )));
        }
        self.try_apply(&entry, &current, &event)?.ok_or_else(|| {
            Error::version_conflict(format!("{} changed concurrently", current.name))
        })
    }

    /// Record a health observation. Returns the new state if it changed.
    pub fn report_health(&self, id: &ModelId, report: HealthReport) -> Result<Option<ModelState>> {
        let entry = self.entry(id)?;
        let state = entry.state();
        if !matches!(state, ModelState::Ready | ModelState::Degraded) {
            return Ok(None);
        }

        let event = match (report.source, report.healthy) {
            (HealthSource::Probe, false) => {
                entry.probe_successes.store(0, Ordering::Release);
                let failures = entry.probe_failures.fetch_add(1, Ordering::AcqRel) + 1;
                (state.is_ready() && failures >= self.thresholds.probe_failures)
                    .then_some(LifecycleEvent::HealthDegraded)
            }
            (HealthSource::Probe, true) => {
                entry.probe_failures.store(0, Ordering::Release);
                let successes = entry.probe_successes.fetch_add(1, Ordering::AcqRel) + 1;
                (state == ModelState::Degraded && successes >= self.thresholds.probe_successes)
                    .then_some(LifecycleEvent::HealthRecovered)
            }
            (HealthSource::Execution, false) => {
                let failures = entry.execution_failures.fetch_add(1, Ordering::AcqRel) + 1;
                (state.is_ready() && failures >= self.thresholds.execution_failures)
                    .then_some(LifecycleEvent::HealthDegraded)
            }
            (HealthSource::Execution, true) => {
                entry.execution_failures.store(0, Ordering::Release);
                None
            }
        };

        let Some(event) = event else {
            return Ok(None);
        };

        // A concurrent report may have made the same move already
        match self.apply(id, event.clone()) {
            Ok(transition) => {
                if event == LifecycleEvent::HealthDegraded {
                    entry.probe_successes.store(0, Ordering::Release);
                    warn!(
                        model = %entry.name(),
                        source = ?report.source,
                        detail = report.detail.as_deref().unwrap_or(""),
                        "Model degraded"
                    );
                } else {
                    entry.probe_failures.store(0, Ordering::Release);
                    entry.execution_failures.store(0, Ordering::Release);
                    info!(model = %entry.name(), "Model recovered");
                }
                Ok(Some(transition.to))
            }
            Err(Error::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Merge an option into the descriptor
    pub fn update_option(
        &self,
        id: &ModelId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<u64> {
        let entry = self.entry(id)?;
        loop {
            let current = entry.descriptor();
            if current.options.get(key) == Some(&value) {
                return Ok(current.version);
            }
            let mut next = (*current).clone();
            next.options.insert(key.to_string(), value.clone());
            next.version += 1;
            let version = next.version;
            let prev = entry.descriptor.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&*prev, &current) {
                debug!(model = %current.name, key, "Updated model option");
                return Ok(version);
            }
        }
    }

    /// Remove a model; only allowed when it holds no resources
    pub fn deregister(&self, id: &ModelId) -> Result<ModelDescriptor> {
        let removed = self
            .models
            .remove_if(id, |_, entry| entry.state().is_removable());
        let Some((_, entry)) = removed else {
            let state = self.entry(id)?.state();
            return Err(Error::invalid_transition(&state, "deregistered"));
        };
        let descriptor = entry.descriptor();
        self.names.remove_if(&descriptor.name, |_, owner| owner == id);
        info!(model = %descriptor.name, "Deregistered model");
        Ok((*descriptor).clone())
    }

    pub fn set_allocation(&self, id: &ModelId, handle: Option<ResourceHandle>) -> Result<()> {
        *self.entry(id)?.allocation.lock() = handle;
        Ok(())
    }

    pub fn take_allocation(&self, id: &ModelId) -> Result<Option<ResourceHandle>> {
        Ok(self.entry(id)?.allocation.lock().take())
    }

    /// Mark `count` requests as entering a backend call
    pub fn begin_execution(&self, id: &ModelId, count: usize) -> Result<()> {
        let entry = self.entry(id)?;
        entry.in_flight.fetch_add(count, Ordering::AcqRel);
        entry.touch();
        Ok(())
    }

    pub fn end_execution(&self, id: &ModelId, count: usize) -> Result<()> {
        let entry = self.entry(id)?;
        let _ = entry
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(count))
            });
        entry.touch();
        Ok(())
    }

    fn apply(&self, id: &ModelId, event: LifecycleEvent) -> Result<Transition> {
        let entry = self.pinned(id)?;
        loop {
            let current = entry.descriptor();
            if let Some(transition) = self.try_apply(&entry, &current, &event)? {
                return Ok(transition);
            }
        }
    }

    /// One compare-and-swap attempt. `Ok(None)` means another writer won.
    fn try_apply(
        &self,
        entry: &ModelEntry,
        current: &Arc<ModelDescriptor>,
        event: &LifecycleEvent,
    ) -> Result<Option<Transition>> {
        let state = current.state.transition(event)?;
        let mut next = (**current).clone();
        next.state = state.clone();
        next.version = current.version + 1;

        let prev = entry.descriptor.compare_and_swap(current, Arc::new(next));
        if !Arc::ptr_eq(&*prev, current) {
            return Ok(None);
        }

        entry.publish_state();
        debug!(
            model = %current.name,
            from = %current.state,
            to = %state,
            version = current.version + 1,
            "Lifecycle transition"
        );
        Ok(Some(Transition {
            from: current.state.clone(),
            to: state,
            version: current.version + 1,
        }))
    }
}

impl ModelEntry {
    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    /// Publish the descriptor's state as of now. Publishes are serialized by
    /// the watch, so the last one always carries the latest state even when
    /// two transitions publish out of order.
    fn publish_state(&self) {
        self.state_tx.send_if_modified(|published| {
            let current = self.descriptor.load();
            if *published == current.state {
                return false;
            }
            *published = current.state.clone();
            true
        });
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}
