//! AstraGuard CLI
//!
//! Config checks and fault-injection simulation for the resilience core.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use astraguard_runtime::RuntimeConfig;

mod sim;

use sim::{FaultScenario, SimOptions};

/// AstraGuard: resilient telemetry anomaly detection
#[derive(Parser)]
#[command(name = "astraguard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a YAML config, then print the effective configuration
    CheckConfig {
        /// Config file (YAML)
        file: PathBuf,
    },

    /// Run the control core against a fault-injecting simulated model
    Simulate {
        /// Config file (YAML); simulation timings when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of evaluations
        #[arg(short, long, default_value_t = 200)]
        requests: u64,

        /// Fault injected into the model for the second quarter of the run
        #[arg(short, long, value_enum, default_value = "none")]
        fault: FaultScenario,

        /// Seed for telemetry and jitter
        #[arg(short, long, default_value_t = 7)]
        seed: u64,

        /// Pause between evaluations in milliseconds
        #[arg(long, default_value_t = 20)]
        pace_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::CheckConfig { file } => check_config(file),
        Commands::Simulate {
            config,
            requests,
            fault,
            seed,
            pace_ms,
        } => {
            sim::run(SimOptions {
                config,
                requests,
                fault,
                seed,
                pace: Duration::from_millis(pace_ms),
            })
            .await
        }
    }
}

fn check_config(file: PathBuf) -> Result<()> {
    let config = RuntimeConfig::from_yaml_file(&file)
        .with_context(|| format!("Invalid config {}", file.display()))?;

    tracing::info!(file = %file.display(), node_id = %config.node_id, "Config is valid");
    print!("{}", config.to_yaml()?);
    Ok(())
}
