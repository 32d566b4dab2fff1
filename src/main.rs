//! curavox-bridge - command-line front end for the worker bridge.
//!
//! Starts the configured worker under supervision, waits for its readiness
//! handshake, and issues a single request. Useful for smoke-testing a worker
//! build without the web service in front of it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use curavox_bridge::{BridgeConfig, RpcClient, Supervisor};

#[derive(Parser)]
#[command(name = "curavox-bridge")]
#[command(about = "Drive the CuraVox inference worker over its stdio protocol")]
#[command(version)]
struct Cli {
    /// Bridge configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds to wait for the worker's startup signal
    #[arg(long, default_value_t = 120)]
    ready_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the result
    Invoke {
        /// Action name understood by the worker
        action: String,

        /// Parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
    },

    /// Start the worker and print its status once ready
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries only results.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "curavox_bridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = BridgeConfig::from_file(path)?;
            config.apply_overrides(|key| std::env::var(key).ok())?;
            config
        }
        None => BridgeConfig::load()?,
    };

    tracing::info!("Starting curavox-bridge v{}", env!("CARGO_PKG_VERSION"));

    let supervisor = Supervisor::new(config);
    supervisor.start().context("Failed to start worker")?;

    let result = run(&supervisor, &cli).await;

    if let Err(e) = supervisor.stop().await {
        tracing::warn!("Failed to stop worker cleanly: {}", e);
    }

    if let Err(e) = &result {
        tracing::error!("Request failed: {:#}", e);
    }
    result
}

async fn run(supervisor: &Supervisor, cli: &Cli) -> Result<()> {
    supervisor
        .wait_ready(Duration::from_secs(cli.ready_timeout))
        .await
        .context("Worker did not report ready")?;

    match &cli.command {
        Commands::Invoke { action, params } => {
            let params: Value = serde_json::from_str(params)
                .with_context(|| format!("Parameters are not valid JSON: {}", params))?;

            let client = RpcClient::new(supervisor);
            let result = client
                .invoke(action, params)
                .await
                .with_context(|| format!("Action '{}' failed", action))?;

            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Status => {
            println!("{}", serde_json::to_string_pretty(&supervisor.status())?);
        }
    }

    Ok(())
}
