//! # choreo
//!
//! Entry point of the choreography engine.
//!
//! ## Startup
//!
//! 1. **Tracing** - `RUST_LOG` or `--log-level`, default `info`
//! 2. **Configuration** - defaults, then the optional TOML file, then flags
//! 3. **Manifests** - every YAML file in `--manifests` is loaded into an
//!    in-memory object store
//! 4. **Manager** - one reconciliation loop per controller
//!
//! `run` stops on Ctrl-C. `reconcile` stops once no controller has had work
//! for `--settle-secs` and prints the status of every intent.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod manifests;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use choreo_reconciler::substrate::TracingSubstrate;
use choreo_reconciler::{InMemorySubstrate, Manager, ReconcilerConfig};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command {
        Commands::Run {
            manifests,
            config,
            workers,
        } => run(&manifests, config.as_deref(), workers).await,
        Commands::Reconcile {
            manifests,
            config,
            settle_secs,
        } => reconcile(&manifests, config.as_deref(), Duration::from_secs(settle_secs)).await,
    }
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing(level: Option<&str>) {
    let filter = level
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>, workers: Option<usize>) -> Result<ReconcilerConfig> {
    let config = match path {
        Some(path) => ReconcilerConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ReconcilerConfig::default(),
    };
    let config = match workers {
        Some(workers) => config.with_workers(workers),
        None => config,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Load manifests into a fresh store and build a manager over it.
async fn prepare(manifests_dir: &Path, config: ReconcilerConfig) -> Result<(InMemorySubstrate, Manager)> {
    let substrate = InMemorySubstrate::new();
    let objects = manifests::load_dir(manifests_dir)?;
    manifests::seed(&substrate, objects).await?;

    let manager = Manager::new(
        Arc::new(TracingSubstrate::new(substrate.clone())),
        Arc::new(substrate.clone()),
        config,
    )
    .context("Failed to create manager")?;
    Ok((substrate, manager))
}

async fn run(manifests_dir: &Path, config: Option<&Path>, workers: Option<usize>) -> Result<()> {
    let config = load_config(config, workers)?;
    let (_substrate, manager) = prepare(manifests_dir, config).await?;

    let stopper = manager.stopper();
    let handle = tokio::spawn(manager.run());
    info!("choreo is running. Press Ctrl+C to stop.");

    wait_for_shutdown().await;
    stopper.stop();

    handle.await.context("Manager task failed")??;
    info!("choreo stopped");
    Ok(())
}

async fn reconcile(manifests_dir: &Path, config: Option<&Path>, settle: Duration) -> Result<()> {
    let config = load_config(config, None)?;
    let (substrate, manager) = prepare(manifests_dir, config).await?;

    manager.run_until_idle(settle).await?;

    let statuses = manifests::intent_statuses(&substrate).await?;
    println!("{statuses}");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(err) => error!(error = %err, "Failed to listen for shutdown signal"),
    }
}
