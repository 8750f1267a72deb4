//! Errors surfaced by the orchestration substrate.

use thiserror::Error;

/// Result type alias for substrate calls.
pub type SubstrateResult<T> = std::result::Result<T, SubstrateError>;

/// Substrate error types, mirroring the status codes of a CRUD+watch API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstrateError {
    #[error("{kind} '{key}' not found")]
    NotFound { kind: String, key: String },

    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: String, key: String },

    #[error("conflict updating {kind} '{key}': {reason}")]
    Conflict {
        kind: String,
        key: String,
        reason: String,
    },

    #[error("{user} is forbidden to {verb} {kind} in namespace '{namespace}'")]
    Forbidden {
        user: String,
        verb: String,
        kind: String,
        namespace: String,
    },

    #[error("{kind} is invalid: {reason}")]
    Invalid { kind: String, reason: String },

    #[error("substrate unavailable: {reason}")]
    Unavailable { reason: String },
}

impl SubstrateError {
    /// Create a not found error.
    pub fn not_found(kind: impl Into<String>, key: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(kind: impl Into<String>, key: impl ToString) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(kind: impl Into<String>, key: impl ToString, reason: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an invalid object error.
    pub fn invalid(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// True for "object does not exist".
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for an authorization rejection (HTTP 403).
    #[must_use]
    pub const fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }

    /// True for an optimistic concurrency failure.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<choreo_core::Error> for SubstrateError {
    fn from(e: choreo_core::Error) -> Self {
        Self::invalid("object", e.to_string())
    }
}
