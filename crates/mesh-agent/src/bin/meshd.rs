//! Main binary for the servemesh daemon (meshd)

use clap::{Parser, Subcommand};
use mesh_agent::{init_agent, AgentConfig, AgentError, Result};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "meshd")]
#[command(about = "servemesh inference serving daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SERVEMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log format (text or json)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,

    /// Serve Prometheus metrics on this address
    #[arg(long, value_name = "ADDR")]
    metrics_bind: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start {
        /// Override configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Start { ref config }) => {
            let config_path = config.clone().or(cli.config.clone());
            start_agent(config_path, &cli).await
        }
        Some(Commands::Config { output }) => generate_config(output),
        Some(Commands::Validate { config }) => validate_config(config),
        None => {
            let config_path = cli.config.clone();
            start_agent(config_path, &cli).await
        }
    }
}

async fn start_agent(config_path: Option<PathBuf>, cli: &Cli) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };

    // Apply CLI overrides
    if let Some(level) = &cli.log_level {
        config.core.observability.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.core.observability.log_format = format.clone();
    }
    if let Some(bind) = &cli.metrics_bind {
        config.core.observability.metrics_enabled = true;
        config.core.observability.metrics_bind = bind.clone();
    }

    let mut agent = init_agent(&config)?;
    match &config_path {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("Using default configuration"),
    }

    if let Err(e) = agent.run().await {
        error!("Daemon failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::default();

    if let Some(output_path) = output {
        config.to_file(&output_path)?;
        println!("Generated configuration file: {}", output_path.display());
    } else {
        let yaml = serde_yaml::to_string(&config)
            .map_err(|e| AgentError::Config(format!("Failed to serialize config: {}", e)))?;
        println!("{}", yaml);
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = AgentConfig::from_file(&config_path)?;
    config.validate()?;

    println!("Configuration is valid");
    println!("Node name: {}", config.core.node.name);
    println!("Devices:");
    for device in &config.core.resources.devices {
        println!("  - {} ({}, capacity {})", device.id, device.kind, device.capacity);
    }
    println!("Models:");
    for model in &config.core.models {
        println!(
            "  - {} [{}] {} x {}{}",
            model.name,
            model.backend,
            model.device_kind,
            model.fraction,
            if model.autoload { ", autoload" } else { "" }
        );
    }
    if config.core.observability.metrics_enabled {
        println!("Metrics: {}", config.core.observability.metrics_bind);
    }

    Ok(())
}
