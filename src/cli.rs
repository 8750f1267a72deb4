//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// choreo - choreography engine
#[derive(Parser, Debug)]
#[command(name = "choreo")]
#[command(version)]
#[command(about = "Stamps pipeline templates for workloads, deliverables and runnables")]
#[command(
    long_about = "choreo loads manifests into an in-memory object store, selects a pipeline for every intent, stamps the pipeline's templates into child objects and reports progress as status conditions."
)]
pub struct Cli {
    /// Log filter, e.g. `info` or `choreo_reconciler=debug`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every controller until Ctrl-C
    Run {
        /// Directory of YAML manifests to load
        #[arg(short, long)]
        manifests: PathBuf,

        /// Reconciler configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Workers per controller
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Reconcile until quiescent, then print intent statuses as YAML
    Reconcile {
        /// Directory of YAML manifests to load
        #[arg(short, long)]
        manifests: PathBuf,

        /// Reconciler configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Seconds without work before stopping
        #[arg(long, default_value_t = 2)]
        settle_secs: u64,
    },
}
