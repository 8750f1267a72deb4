//! Result type definition and extension traits.

use crate::error::Error;

/// The standard Result type for object model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for results whose failure is only worth a log line.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self, what: &str) -> Option<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn into_option_logged(self, what: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "{what} ignored");
                None
            }
        }
    }
}
