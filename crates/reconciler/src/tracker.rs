//! Dependency tracking.
//!
//! [`DependencyTracker`] remembers which owners read which objects (templates,
//! service accounts, secrets) so a change to one of them can be mapped back
//! to the owners that must be reconciled again. Entries expire after a lease
//! unless the owner tracks them again.
//!
//! [`StampedTracker`] remembers which kinds of stamped children are already
//! being watched, so a watch is started once per kind no matter how many
//! owners stamp that kind.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use choreo_core::{DynamicObject, ObjectKey, Resource, TypeMeta};
use moka::sync::Cache;
use tokio::sync::mpsc;
use tracing::debug;

/// An object identified by kind and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub type_meta: TypeMeta,
    pub key: ObjectKey,
}

impl Reference {
    #[must_use]
    pub const fn new(type_meta: TypeMeta, key: ObjectKey) -> Self {
        Self { type_meta, key }
    }

    /// Reference to a typed object.
    #[must_use]
    pub fn of<T: Resource>(obj: &T) -> Self {
        Self::new(T::type_meta(), obj.key())
    }

    /// Reference to an unstructured object.
    #[must_use]
    pub fn of_dynamic(obj: &DynamicObject) -> Self {
        Self::new(obj.type_meta(), obj.key())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.type_meta, self.key)
    }
}

/// Leased index from dependencies to the owners that read them.
pub struct DependencyTracker {
    entries: Cache<(Reference, Reference), ()>,
}

impl DependencyTracker {
    /// Create a tracker whose entries live for `lease` after their last
    /// [`track`](Self::track).
    #[must_use]
    pub fn new(lease: Duration) -> Self {
        Self {
            entries: Cache::builder().time_to_live(lease).build(),
        }
    }

    /// Record that `owner` depends on `dependency`, renewing the lease.
    pub fn track(&self, dependency: Reference, owner: Reference) {
        debug!(dependency = %dependency, owner = %owner, "Tracking dependency");
        self.entries.insert((dependency, owner), ());
    }

    /// Owners currently depending on `dependency`.
    #[must_use]
    pub fn lookup(&self, dependency: &Reference) -> Vec<Reference> {
        let owners: BTreeSet<Reference> = self
            .entries
            .iter()
            .filter(|(entry, ())| &entry.0 == dependency)
            .map(|(entry, ())| entry.1.clone())
            .collect();
        owners.into_iter().collect()
    }

    /// Forget every dependency of `owner`.
    pub fn clear_tracked(&self, owner: &Reference) {
        let stale: Vec<_> = self
            .entries
            .iter()
            .filter(|(entry, ())| &entry.1 == owner)
            .map(|(entry, ())| entry)
            .collect();
        for entry in stale {
            self.entries.invalidate(entry.as_ref());
        }
    }
}

impl fmt::Debug for DependencyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyTracker")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

/// Starts one watch per stamped kind.
#[derive(Debug)]
pub struct StampedTracker {
    watched: Mutex<BTreeSet<TypeMeta>>,
    requests: mpsc::UnboundedSender<TypeMeta>,
}

impl StampedTracker {
    /// Create a tracker that asks for new watches on `requests`.
    #[must_use]
    pub const fn new(requests: mpsc::UnboundedSender<TypeMeta>) -> Self {
        Self {
            watched: Mutex::new(BTreeSet::new()),
            requests,
        }
    }

    /// Ensure `type_meta` is watched. Returns true if this call asked for the
    /// watch.
    pub fn watch(&self, type_meta: &TypeMeta) -> bool {
        let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
        if watched.contains(type_meta) {
            return false;
        }
        if self.requests.send(type_meta.clone()).is_err() {
            debug!(kind = %type_meta, "No watch receiver, watch not started");
            return false;
        }
        debug!(kind = %type_meta, "Requested watch on stamped kind");
        watched.insert(type_meta.clone());
        true
    }

    /// Kinds watched so far.
    #[must_use]
    pub fn watched(&self) -> Vec<TypeMeta> {
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn template(name: &str) -> Reference {
        Reference::new(
            TypeMeta::new("carto.run/v1alpha1", "ClusterTemplate"),
            ObjectKey::cluster(name),
        )
    }

    fn workload(name: &str) -> Reference {
        Reference::new(
            TypeMeta::new("carto.run/v1alpha1", "Workload"),
            ObjectKey::namespaced("dev", name),
        )
    }

    #[test]
    fn test_lookup_returns_tracking_owners() {
        let tracker = DependencyTracker::new(Duration::from_secs(60));
        tracker.track(template("deploy"), workload("a"));
        tracker.track(template("deploy"), workload("b"));
        tracker.track(template("deploy"), workload("a"));
        tracker.track(template("other"), workload("c"));

        assert_eq!(tracker.lookup(&template("deploy")), vec![workload("a"), workload("b")]);
        assert!(tracker.lookup(&template("missing")).is_empty());
    }

    #[test]
    fn test_clear_tracked_forgets_owner() {
        let tracker = DependencyTracker::new(Duration::from_secs(60));
        tracker.track(template("deploy"), workload("a"));
        tracker.track(template("build"), workload("a"));
        tracker.track(template("deploy"), workload("b"));

        tracker.clear_tracked(&workload("a"));
        assert_eq!(tracker.lookup(&template("deploy")), vec![workload("b")]);
        assert!(tracker.lookup(&template("build")).is_empty());
    }

    #[test]
    fn test_entries_expire_after_lease() {
        let tracker = DependencyTracker::new(Duration::from_millis(20));
        tracker.track(template("deploy"), workload("a"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(tracker.lookup(&template("deploy")).is_empty());
    }

    #[test]
    fn test_stamped_kind_is_watched_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = StampedTracker::new(tx);
        let kind = TypeMeta::new("v1", "ConfigMap");

        assert!(tracker.watch(&kind));
        assert!(!tracker.watch(&kind));
        assert_eq!(rx.try_recv().unwrap(), kind);
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.watched(), vec![kind]);
    }
}
