//! Configuration management for the servemesh daemon

use crate::{AgentError, Result};
use mesh_core::Config as CoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete configuration for the daemon
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Engine configuration
    #[serde(flatten)]
    pub core: CoreConfig,

    /// Daemon-specific settings
    #[serde(default)]
    pub agent: AgentSpecificConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Daemon-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpecificConfig {
    /// Graceful shutdown timeout (seconds)
    pub shutdown_timeout_seconds: u64,
}

impl Default for AgentSpecificConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_seconds: 30,
        }
    }
}

/// Logging configuration. Level and format live in the engine's
/// `observability` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Show target in logs
    pub show_target: bool,

    /// Show thread IDs in logs
    pub show_thread_ids: bool,

    /// Show line numbers in logs
    pub show_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("Failed to read config file: {}", e)))?;

        serde_yaml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| AgentError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| AgentError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.core
            .validate()
            .map_err(|e| AgentError::Config(format!("Core config validation failed: {}", e)))?;

        if self.agent.shutdown_timeout_seconds == 0 {
            return Err(AgentError::Config(
                "Shutdown timeout must be greater than 0".to_string(),
            ));
        }

        let observability = &self.core.observability;
        match observability.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(AgentError::Config(format!("Invalid log level: {}", other))),
        }
        match observability.log_format.as_str() {
            "text" | "json" => {}
            other => return Err(AgentError::Config(format!("Invalid log format: {}", other))),
        }

        Ok(())
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.agent.shutdown_timeout_seconds)
    }
}
