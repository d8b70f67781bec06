//! Core agent implementation

use crate::{config::AgentConfig, AgentError, Result};
use mesh_backend::BackendRegistry;
use mesh_engine::Engine;
use mesh_metrics::{PrometheusExporter, Readiness};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// The servemesh daemon
pub struct Agent {
    config: AgentConfig,
    backends: Option<BackendRegistry>,
    engine: Option<Arc<Engine>>,
    exporter: Option<PrometheusExporter>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Agent {
    /// Create a new agent with the given configuration
    pub(crate) fn new(config: AgentConfig, backends: BackendRegistry) -> Self {
        Self {
            config,
            backends: Some(backends),
            engine: None,
            exporter: None,
            shutdown_tx: None,
        }
    }

    /// Start the engine and the metrics endpoint
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting servemesh daemon: {}", self.config.core.node.name);

        self.config.validate()?;

        let backends = self
            .backends
            .take()
            .ok_or_else(|| AgentError::Service("agent was already started".to_string()))?;
        let engine = Engine::start(self.config.core.clone(), backends).await?;

        let observability = &self.config.core.observability;
        if observability.metrics_enabled {
            let mut exporter = PrometheusExporter::from_bind_str(
                engine.metrics_registry().clone(),
                &observability.metrics_bind,
            )?
            .with_readiness(Arc::clone(&engine) as Arc<dyn Readiness>);
            exporter.start_server().await?;
            info!("Metrics available at {}", exporter.metrics_url());
            self.exporter = Some(exporter);
        }

        self.engine = Some(engine);
        info!("servemesh daemon started successfully");
        Ok(())
    }

    /// Stop the metrics endpoint and the engine
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping servemesh daemon");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut exporter) = self.exporter.take() {
            exporter.stop_server().await;
        }

        if let Some(engine) = self.engine.take() {
            let timeout = self.config.shutdown_timeout();
            if tokio::time::timeout(timeout, engine.shutdown()).await.is_err() {
                warn!(
                    "Engine did not shut down within {}s",
                    self.config.agent.shutdown_timeout_seconds
                );
            }
        }

        info!("servemesh daemon stopped");
        Ok(())
    }

    /// Run the agent until a shutdown signal is received
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        tokio::select! {
            _ = shutdown_rx => {
                info!("Received shutdown signal");
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C signal");
            }
            result = wait_for_termination() => {
                if let Err(e) = result {
                    error!("Failed to listen for termination signals: {}", e);
                }
            }
        }

        self.stop().await
    }

    /// Get the agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The running engine, once started
    pub fn engine(&self) -> Option<&Arc<Engine>> {
        self.engine.as_ref()
    }
}

/// Wait for termination signals (SIGTERM, SIGINT)
#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for termination signals (Windows)
#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<()> {
    signal::ctrl_c().await
}

/// Builder for creating agents
pub struct AgentBuilder {
    config: Option<AgentConfig>,
    backends: Option<BackendRegistry>,
}

impl AgentBuilder {
    /// Create a new agent builder
    pub fn new() -> Self {
        Self {
            config: None,
            backends: None,
        }
    }

    /// Set the agent configuration
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the built-in backend set
    pub fn with_backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = Some(backends);
        self
    }

    /// Build the agent
    pub fn build(self) -> Result<Agent> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let backends = self.backends.unwrap_or_else(BackendRegistry::with_builtin);
        Ok(Agent::new(config, backends))
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{BackendKind, DeviceKind, ModelSpec, Payload};

    fn config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.core.health.enabled = false;
        config.core.models.push(ModelSpec {
            name: "echo".to_string(),
            backend: BackendKind::Echo,
            artifact: "none".to_string(),
            options: Default::default(),
            device_kind: DeviceKind::Cpu,
            fraction: 0.5,
            priority_class: 0,
            batching: None,
            autoload: true,
        });
        config
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = config();
        config.agent.shutdown_timeout_seconds = 0;
        assert!(AgentBuilder::new().with_config(config).build().is_err());
    }

    #[tokio::test]
    async fn test_agent_start_and_stop() {
        let mut agent = AgentBuilder::new().with_config(config()).build().unwrap();
        assert!(agent.engine().is_none());

        agent.start().await.unwrap();
        let engine = Arc::clone(agent.engine().unwrap());
        let result = engine
            .submit("echo", Payload::from("ping"), None, None)
            .unwrap()
            .wait()
            .await;
        assert_eq!(result, Ok(Payload::from("ping")));

        // Starting twice is refused
        assert!(matches!(agent.start().await, Err(AgentError::Service(_))));

        agent.stop().await.unwrap();
        assert!(agent.engine().is_none());
        assert_eq!(
            engine.get_model_status("echo").unwrap().state,
            mesh_core::ModelState::Unloaded
        );
    }
}
