//! Submit cache.
//!
//! Remembers what the engine last submitted for an identity and what the
//! substrate persisted after admission, so that re-submitting an unchanged
//! desired object is a no-op even when admission mutated the stored form.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use choreo_core::DynamicObject;
use itertools::Itertools;
use moka::sync::Cache;
use serde_json::{Map, Value};
use tracing::debug;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries per map
    pub max_capacity: u64,
    /// Time to live for entries
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Memoizer of `(last submitted, last persisted)` pairs keyed by identity.
pub struct SubmitCache {
    submitted: Cache<String, DynamicObject>,
    persisted: Cache<String, DynamicObject>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for SubmitCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SubmitCache {
    /// Create a cache with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&CacheConfig::default())
    }

    /// Create a cache with custom configuration.
    #[must_use]
    pub fn with_config(config: &CacheConfig) -> Self {
        let build = || {
            Cache::builder()
                .max_capacity(config.max_capacity)
                .time_to_live(config.ttl)
                .build()
        };
        Self {
            submitted: build(),
            persisted: build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Record what was submitted and what the substrate returned for it.
    pub fn set(&self, submitted: &DynamicObject, persisted: &DynamicObject) {
        let key = cache_key(submitted);
        debug!(key = %key, "Caching submission");
        self.submitted.insert(key.clone(), submitted.clone());
        self.persisted.insert(key, persisted.clone());
    }

    /// The live object, if `submitted` equals the last submission under its
    /// key and `live` still matches what was persisted for it.
    pub fn unchanged_since(&self, submitted: &DynamicObject, live: &DynamicObject) -> Option<DynamicObject> {
        self.unchanged_since_from_list(submitted, std::slice::from_ref(live))
    }

    /// Like [`unchanged_since`](Self::unchanged_since), scanning `live` for any match.
    pub fn unchanged_since_from_list(
        &self,
        submitted: &DynamicObject,
        live: &[DynamicObject],
    ) -> Option<DynamicObject> {
        let key = cache_key(submitted);
        let matched = self
            .submitted
            .get(&key)
            .filter(|previous| previous == submitted)
            .and_then(|_| self.persisted.get(&key))
            .and_then(|persisted| {
                let expected = comparable(&persisted);
                live.iter().find(|obj| comparable(obj) == expected).cloned()
            });

        match matched {
            Some(live) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                // Refresh the expiry of both halves.
                if let Some(previous) = self.submitted.get(&key) {
                    self.submitted.insert(key.clone(), previous);
                }
                if let Some(persisted) = self.persisted.get(&key) {
                    self.persisted.insert(key, persisted);
                }
                Some(live)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Hit and miss counts since creation.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// `namespace:kind:name`, or for server-named objects
/// `namespace:kind:generateName:labels` so that children of different owners
/// stamped from one template do not share an entry.
fn cache_key(obj: &DynamicObject) -> String {
    let namespace = obj.metadata.namespace.as_deref().unwrap_or_default();
    if obj.metadata.name.is_empty() {
        let labels = obj
            .metadata
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .join(",");
        format!(
            "{namespace}:{}:{}:{labels}",
            obj.kind, obj.metadata.generate_name
        )
    } else {
        format!("{namespace}:{}:{}", obj.kind, obj.metadata.name)
    }
}

/// Everything outside metadata and status.
fn comparable(obj: &DynamicObject) -> Map<String, Value> {
    obj.content_without_status()
}
