//! Error types for the reconciler crate.

use std::fmt;

use crate::realizer::RealizeError;
use crate::repository::RepositoryError;
use crate::substrate::SubstrateError;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// A reconcile that returns one of these is requeued with backoff; handled
/// failures are recorded as conditions and never surface here.
#[derive(Debug, Clone)]
pub enum Error {
    /// A substrate call failed.
    Substrate(SubstrateError),
    /// A repository read or write failed.
    Repository(RepositoryError),
    /// A step failed in a way that must be retried.
    Realize(RealizeError),
    /// Reconciliation failed.
    ReconcileFailed { reason: String },
    /// Loop was stopped.
    LoopStopped,
    /// Invalid configuration.
    InvalidConfig { reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Substrate(e) => write!(f, "substrate error: {e}"),
            Self::Repository(e) => write!(f, "repository error: {e}"),
            Self::Realize(e) => write!(f, "{e}"),
            Self::ReconcileFailed { reason } => {
                write!(f, "reconciliation failed: {reason}")
            }
            Self::LoopStopped => {
                write!(f, "reconciliation loop stopped")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<SubstrateError> for Error {
    fn from(e: SubstrateError) -> Self {
        Self::Substrate(e)
    }
}

impl From<RepositoryError> for Error {
    fn from(e: RepositoryError) -> Self {
        Self::Repository(e)
    }
}

impl From<RealizeError> for Error {
    fn from(e: RealizeError) -> Self {
        Self::Realize(e)
    }
}

impl Error {
    /// Create a reconcile failed error.
    pub fn reconcile_failed(reason: impl Into<String>) -> Self {
        Self::ReconcileFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// True when the underlying substrate error is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        match self {
            Self::Substrate(e) | Self::Repository(RepositoryError::Substrate(e)) => e.is_conflict(),
            _ => false,
        }
    }
}
