//! Backend health probing

use crate::lifecycle::LifecycleManager;
use crate::registry::{HealthReport, ModelRegistry};
use mesh_core::{Error, HealthConfig, HealthStatus, ModelId, ModelState, Result};
use mesh_metrics::EngineMetrics;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Probes loaded backends and feeds the results to the registry
#[derive(Debug)]
pub struct HealthMonitor {
    registry: Arc<ModelRegistry>,
    lifecycle: Arc<LifecycleManager>,
    config: HealthConfig,
    metrics: Arc<EngineMetrics>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ModelRegistry>,
        lifecycle: Arc<LifecycleManager>,
        config: HealthConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            config,
            metrics,
        }
    }

    /// Probe one model now. Returns the new state if the probe changed it.
    pub async fn check_now(&self, id: &ModelId) -> Result<Option<ModelState>> {
        let entry = self.registry.entry(id)?;
        let name = entry.name();
        let backend = self
            .lifecycle
            .backend(id)
            .ok_or_else(|| Error::model_not_ready(&name, entry.state()))?;

        let status = match timeout(self.config.timeout(), backend.health_check()).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Unhealthy(format!(
                "health check timed out after {}ms",
                self.config.timeout_ms
            )),
        };

        let report = match &status {
            HealthStatus::Healthy => HealthReport::probe(true),
            HealthStatus::Unhealthy(reason) => HealthReport::probe(false).with_detail(reason),
            other => HealthReport::probe(false).with_detail(format!("{:?}", other)),
        };
        if !report.healthy {
            debug!(model = %name, status = ?status, "Health probe failed");
        }

        let changed = self.registry.report_health(id, report)?;
        if let Some(state) = &changed {
            self.metrics.set_model_state(&name, state.code());
        }
        Ok(changed)
    }

    /// Probe every model that has a running backend
    pub async fn check_all(&self) {
        for id in self.lifecycle.loaded_models() {
            if let Err(e) = self.check_now(&id).await {
                debug!(model = %id, error = %e, "Skipped health probe");
            }
        }
    }

    /// Run probes every `interval` until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.config.interval_ms, "Health monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.check_all().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Health monitor stopped");
        })
    }
}
