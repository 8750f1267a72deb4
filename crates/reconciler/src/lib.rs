//! Choreography engine: selects a pipeline for each intent, stamps the
//! pipeline's templates into child objects, and reports progress as
//! conditions on the intent.
//!
//! # Key Concepts
//!
//! ## Reconciliation
//!
//! Each tick of an intent reconciler:
//! 1. Selects exactly one pipeline whose predicates the intent satisfies
//! 2. Builds a client acting as the intent's service account
//! 3. Realizes every step: template, inputs, stamp, apply, outputs
//! 4. Folds the step results into conditions and writes status if it changed
//!
//! ## Layers
//!
//! - [`selector`] - pipeline and template-option matching
//! - [`cache`] - the submit cache that keeps steady ticks write-free
//! - [`substrate`] - the object store contract and its in-memory implementation
//! - [`repository`] - typed reads and idempotent writes over a substrate
//! - [`stamp`] - placeholder substitution into template bodies
//! - [`realizer`] - runs one pipeline for one intent
//! - [`controller`] - intent and pipeline reconcilers
//! - [`queue`], [`r#loop`], [`manager`] - scheduling
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use choreo_reconciler::{InMemorySubstrate, Manager, ReconcilerConfig};
//!
//! #[tokio::main]
//! async fn main() -> choreo_reconciler::Result<()> {
//!     let substrate = InMemorySubstrate::new();
//!     let manager = Manager::new(
//!         Arc::new(substrate.clone()),
//!         Arc::new(substrate),
//!         ReconcilerConfig::default(),
//!     )?;
//!     manager.run_until_idle(std::time::Duration::from_secs(1)).await
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod r#loop;
pub mod manager;
pub mod queue;
pub mod realizer;
pub mod repository;
pub mod selector;
pub mod stamp;
pub mod substrate;
pub mod tracker;

// Re-export main types
pub use cache::{CacheConfig, CacheStats, SubmitCache};
pub use config::ReconcilerConfig;
pub use controller::{BlueprintReconciler, Context, Intent, OwnerReconciler, Pipeline};
pub use error::{Error, Result};
pub use manager::Manager;
pub use queue::WorkQueue;
pub use r#loop::{Action, LoopConfig, LoopStopper, Reconcile, ReconciliationLoop};
pub use realizer::{RealizeError, Realizer};
pub use repository::{Repository, RepositoryError};
pub use selector::{best_matches, Candidate, Selectable, SelectorError};
pub use substrate::{ClientBuilder, Credentials, InMemorySubstrate, Substrate, SubstrateError};
pub use tracker::{DependencyTracker, Reference, StampedTracker};
