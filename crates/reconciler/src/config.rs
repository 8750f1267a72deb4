//! Reconciler configuration.
//!
//! Defaults, then an optional TOML file, then whatever the caller overrides
//! through the builder methods. Every constructor path ends in `validate()`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{Error, Result};

const fn default_workers() -> usize {
    2
}

const fn default_requeue_interval_secs() -> u64 {
    5
}

const fn default_cache_ttl_secs() -> u64 {
    3600
}

const fn default_dependency_lease_secs() -> u64 {
    600
}

const fn default_backoff_base_ms() -> u64 {
    100
}

const fn default_backoff_max_secs() -> u64 {
    300
}

fn default_service_account() -> String {
    "default".to_string()
}

/// Configuration shared by every controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Parallel workers per controller.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Liveness requeue after a successful reconcile.
    #[serde(default = "default_requeue_interval_secs")]
    pub requeue_interval_secs: u64,
    /// Submit cache entry lifetime.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// How long a tracked dependency keeps re-queueing its owner.
    #[serde(default = "default_dependency_lease_secs")]
    pub dependency_lease_secs: u64,
    /// First backoff delay after an unhandled error.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Account used when neither the intent nor its pipeline names one.
    #[serde(default = "default_service_account")]
    pub default_service_account: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            requeue_interval_secs: default_requeue_interval_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            dependency_lease_secs: default_dependency_lease_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            default_service_account: default_service_account(),
        }
    }
}

impl ReconcilerConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the document does not parse or fails validation.
    pub fn from_toml(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| Error::invalid_config(format!("malformed TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let input = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&input)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.requeue_interval_secs == 0 {
            return Err(Error::invalid_config(
                "requeue_interval_secs must be at least 1",
            ));
        }
        if self.backoff_base_ms == 0 {
            return Err(Error::invalid_config("backoff_base_ms must be at least 1"));
        }
        if Duration::from_millis(self.backoff_base_ms) > self.backoff_max() {
            return Err(Error::invalid_config(
                "backoff_base_ms must not exceed backoff_max_secs",
            ));
        }
        if self.default_service_account.trim().is_empty() {
            return Err(Error::invalid_config(
                "default_service_account must not be empty",
            ));
        }
        Ok(())
    }

    /// Set the worker count.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the liveness requeue interval.
    #[must_use]
    pub const fn with_requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval_secs = interval.as_secs();
        self
    }

    /// Set the fallback service account.
    #[must_use]
    pub fn with_default_service_account(mut self, name: impl Into<String>) -> Self {
        self.default_service_account = name.into();
        self
    }

    #[must_use]
    pub const fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_interval_secs)
    }

    #[must_use]
    pub const fn dependency_lease(&self) -> Duration {
        Duration::from_secs(self.dependency_lease_secs)
    }

    #[must_use]
    pub const fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[must_use]
    pub const fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    /// Submit cache settings derived from this configuration.
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.cache_ttl_secs),
            ..CacheConfig::default()
        }
    }
}
