//! Core error types for choreo object handling.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use thiserror::Error;

/// Core error type for object model operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Parsing errors
    #[error("JSON parse error: {reason}")]
    JsonParseFailed { reason: String },

    #[error("YAML parse error: {reason}")]
    YamlParseFailed { reason: String },

    // Object errors
    #[error("invalid {kind} object: {reason}")]
    InvalidObject { kind: String, reason: String },

    #[error("expected kind {expected}, found {found}")]
    KindMismatch { expected: String, found: String },

    // Path evaluation errors
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("path '{path}' does not exist")]
    PathNotFound { path: String },

    #[error("path '{path}' returned {count} results, expected exactly one")]
    AmbiguousPath { path: String, count: usize },
}

impl Error {
    /// Create a JSON parse error.
    pub fn json_parse_failed(reason: impl Into<String>) -> Self {
        Self::JsonParseFailed {
            reason: reason.into(),
        }
    }

    /// Create a YAML parse error.
    pub fn yaml_parse_failed(reason: impl Into<String>) -> Self {
        Self::YamlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid object error.
    pub fn invalid_object(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidObject {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create a kind mismatch error.
    pub fn kind_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::KindMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create an invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a path-not-found error.
    pub fn path_not_found(path: impl Into<String>) -> Self {
        Self::PathNotFound { path: path.into() }
    }

    /// True when the error only means the path resolved to nothing.
    #[must_use]
    pub const fn is_path_not_found(&self) -> bool {
        matches!(self, Self::PathNotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::json_parse_failed(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::yaml_parse_failed(e.to_string())
    }
}
