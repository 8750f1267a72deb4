//! In-memory substrate.
//!
//! Behaves like the real API server where the engine can observe it:
//! resourceVersion optimistic concurrency, `generateName`, generation bumps
//! on spec changes, admission mutation, per-user authorization, owner
//! reference cascade delete and a watch broadcast.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use choreo_core::{DynamicObject, ObjectKey, TypeMeta};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use ulid::Ulid;

use super::patch::{apply_merge_patch, create_merge_patch};
use super::{
    ClientBuilder, Credentials, Substrate, SubstrateError, SubstrateResult, Verb, WatchEvent,
    WatchEventType, WatchStream,
};

type StoreKey = (TypeMeta, ObjectKey);
type Mutator = Arc<dyn Fn(&mut DynamicObject) + Send + Sync>;

/// Deny `verb` on `kind` for `user`. `kind` may be `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRule {
    pub user: String,
    pub verb: Verb,
    pub kind: String,
}

impl AccessRule {
    /// Create a deny rule.
    pub fn deny(user: impl Into<String>, verb: Verb, kind: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            verb,
            kind: kind.into(),
        }
    }

    fn matches(&self, user: &str, verb: Verb, kind: &str) -> bool {
        self.user == user && self.verb == verb && (self.kind == "*" || self.kind == kind)
    }
}

/// Counts of writes the substrate accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubstrateStats {
    pub creates: u64,
    pub patches: u64,
    pub status_updates: u64,
    pub deletes: u64,
}

impl SubstrateStats {
    /// Create and patch calls, the writes the submit cache exists to avoid.
    #[must_use]
    pub const fn object_writes(&self) -> u64 {
        self.creates.saturating_add(self.patches)
    }
}

#[derive(Default)]
struct Counters {
    creates: AtomicU64,
    patches: AtomicU64,
    status_updates: AtomicU64,
    deletes: AtomicU64,
}

struct Store {
    objects: RwLock<BTreeMap<StoreKey, DynamicObject>>,
    mutators: RwLock<HashMap<String, Vec<Mutator>>>,
    denied: RwLock<Vec<AccessRule>>,
    failures: RwLock<HashMap<(Verb, String), SubstrateError>>,
    client_error: std::sync::RwLock<Option<String>>,
    version: AtomicU64,
    counters: Counters,
    events: broadcast::Sender<WatchEvent>,
}

/// In-memory substrate. Clones share the same store.
#[derive(Clone)]
pub struct InMemorySubstrate {
    store: Arc<Store>,
    user: Option<String>,
}

impl Default for InMemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySubstrate {
    /// Create an empty substrate acting as the system identity.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(4096);
        Self {
            store: Arc::new(Store {
                objects: RwLock::new(BTreeMap::new()),
                mutators: RwLock::new(HashMap::new()),
                denied: RwLock::new(Vec::new()),
                failures: RwLock::new(HashMap::new()),
                client_error: std::sync::RwLock::new(None),
                version: AtomicU64::new(0),
                counters: Counters::default(),
                events,
            }),
            user: None,
        }
    }

    /// A handle on the same store acting as `user`.
    #[must_use]
    pub fn impersonate(&self, user: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            user: Some(user.into()),
        }
    }

    /// The identity this handle acts as, `None` for the system identity.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Register an admission mutator for a kind, run on create and patch.
    pub async fn add_mutator<F>(&self, kind: impl Into<String>, mutator: F)
    where
        F: Fn(&mut DynamicObject) + Send + Sync + 'static,
    {
        self.store
            .mutators
            .write()
            .await
            .entry(kind.into())
            .or_default()
            .push(Arc::new(mutator));
    }

    /// Add a deny rule.
    pub async fn deny(&self, rule: AccessRule) {
        self.store.denied.write().await.push(rule);
    }

    /// Fail every `verb` on `kind` with `error` until cleared.
    pub async fn fail(&self, verb: Verb, kind: impl Into<String>, error: SubstrateError) {
        self.store
            .failures
            .write()
            .await
            .insert((verb, kind.into()), error);
    }

    /// Remove all injected failures.
    pub async fn clear_failures(&self) {
        self.store.failures.write().await.clear();
    }

    /// Make [`ClientBuilder::build`] fail with `reason`, or succeed again with `None`.
    pub fn set_client_error(&self, reason: Option<String>) {
        if let Ok(mut guard) = self.store.client_error.write() {
            *guard = reason;
        }
    }

    /// Write counters.
    #[must_use]
    pub fn stats(&self) -> SubstrateStats {
        let c = &self.store.counters;
        SubstrateStats {
            creates: c.creates.load(Ordering::Relaxed),
            patches: c.patches.load(Ordering::Relaxed),
            status_updates: c.status_updates.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
        }
    }

    /// Create or replace an object as an external actor would, status
    /// included. Not counted in [`stats`](Self::stats).
    ///
    /// # Errors
    ///
    /// Returns an error if the object has no kind or name.
    pub async fn seed(&self, object: DynamicObject) -> SubstrateResult<DynamicObject> {
        validate(&object)?;
        if object.metadata.name.is_empty() {
            return Err(SubstrateError::invalid(&object.kind, "seeded objects need a name"));
        }
        let key = store_key(&object);
        let (stored, event_type) = {
            let mut objects = self.store.objects.write().await;
            let mut next = object;
            let event_type = match objects.get(&key) {
                Some(existing) => {
                    let generation = if existing.content_without_status() == next.content_without_status() {
                        existing.metadata.generation
                    } else {
                        existing.metadata.generation.saturating_add(1)
                    };
                    next.metadata.uid.clone_from(&existing.metadata.uid);
                    next.metadata.creation_timestamp = existing.metadata.creation_timestamp;
                    next.metadata.generation = generation;
                    WatchEventType::Modified
                }
                None => {
                    next.metadata.uid = Ulid::new().to_string().to_lowercase();
                    next.metadata.creation_timestamp = Some(Utc::now());
                    next.metadata.generation = 1;
                    WatchEventType::Added
                }
            };
            next.metadata.resource_version = self.next_version();
            objects.insert(key, next.clone());
            (next, event_type)
        };
        self.publish(event_type, &stored);
        Ok(stored)
    }

    /// Replace just the status of an object as its own controller would.
    /// Not counted in [`stats`](Self::stats).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object does not exist.
    pub async fn seed_status(&self, type_meta: &TypeMeta, key: &ObjectKey, status: Value) -> SubstrateResult<DynamicObject> {
        let stored = {
            let mut objects = self.store.objects.write().await;
            let stored = objects
                .get_mut(&(type_meta.clone(), key.clone()))
                .ok_or_else(|| SubstrateError::not_found(&type_meta.kind, key))?;
            stored.set_status(status);
            stored.metadata.resource_version = self.next_version();
            stored.clone()
        };
        self.publish(WatchEventType::Modified, &stored);
        Ok(stored)
    }

    /// Every stored object of a kind, across namespaces.
    pub async fn all(&self, type_meta: &TypeMeta) -> Vec<DynamicObject> {
        self.store
            .objects
            .read()
            .await
            .iter()
            .filter(|((tm, _), _)| tm == type_meta)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    fn next_version(&self) -> String {
        self.store
            .version
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1)
            .to_string()
    }

    fn publish(&self, event_type: WatchEventType, object: &DynamicObject) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.store.events.send(WatchEvent {
            event_type,
            object: object.clone(),
        });
    }

    async fn check(&self, verb: Verb, kind: &str, namespace: Option<&str>) -> SubstrateResult<()> {
        if let Some(error) = self.store.failures.read().await.get(&(verb, kind.to_string())) {
            return Err(error.clone());
        }
        let Some(user) = &self.user else {
            return Ok(());
        };
        let denied = self
            .store
            .denied
            .read()
            .await
            .iter()
            .any(|rule| rule.matches(user, verb, kind));
        if denied {
            return Err(SubstrateError::Forbidden {
                user: user.clone(),
                verb: verb.to_string(),
                kind: kind.to_string(),
                namespace: namespace.unwrap_or_default().to_string(),
            });
        }
        Ok(())
    }

    async fn admit(&self, object: &mut DynamicObject) {
        let mutators = self.store.mutators.read().await;
        for mutator in mutators.get(&object.kind).into_iter().flatten() {
            mutator(object);
        }
    }
}

fn store_key(object: &DynamicObject) -> StoreKey {
    (object.type_meta(), object.key())
}

fn validate(object: &DynamicObject) -> SubstrateResult<()> {
    if object.api_version.is_empty() || object.kind.is_empty() {
        return Err(SubstrateError::invalid(
            "object",
            "apiVersion and kind are required",
        ));
    }
    Ok(())
}

fn generated_suffix() -> String {
    let id = Ulid::new().to_string().to_lowercase();
    id.chars().rev().take(5).collect()
}

/// The parts of an object a merge patch may touch.
fn patchable(object: &DynamicObject) -> SubstrateResult<Value> {
    let mut copy = object.clone();
    copy.data.remove("status");
    copy.metadata.uid.clear();
    copy.metadata.resource_version.clear();
    copy.metadata.generation = 0;
    copy.metadata.creation_timestamp = None;
    Ok(copy.to_value()?)
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    async fn get(&self, type_meta: &TypeMeta, key: &ObjectKey) -> SubstrateResult<DynamicObject> {
        self.check(Verb::Get, &type_meta.kind, key.namespace.as_deref())
            .await?;
        self.store
            .objects
            .read()
            .await
            .get(&(type_meta.clone(), key.clone()))
            .cloned()
            .ok_or_else(|| SubstrateError::not_found(&type_meta.kind, key))
    }

    async fn list(
        &self,
        type_meta: &TypeMeta,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> SubstrateResult<Vec<DynamicObject>> {
        self.check(Verb::List, &type_meta.kind, namespace).await?;
        Ok(self
            .store
            .objects
            .read()
            .await
            .iter()
            .filter(|((tm, key), _)| {
                tm == type_meta
                    && namespace.is_none_or(|ns| key.namespace.as_deref() == Some(ns))
            })
            .filter(|(_, obj)| obj.metadata.has_labels(labels))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, object: &DynamicObject) -> SubstrateResult<DynamicObject> {
        validate(object)?;
        self.check(Verb::Create, &object.kind, object.metadata.namespace.as_deref())
            .await?;

        let mut created = object.clone();
        if created.metadata.name.is_empty() {
            if created.metadata.generate_name.is_empty() {
                return Err(SubstrateError::invalid(
                    &created.kind,
                    "name or generateName is required",
                ));
            }
            created.metadata.name = format!("{}{}", created.metadata.generate_name, generated_suffix());
        }
        self.admit(&mut created).await;

        let key = store_key(&created);
        {
            let mut objects = self.store.objects.write().await;
            if objects.contains_key(&key) {
                return Err(SubstrateError::already_exists(&created.kind, &key.1));
            }
            created.metadata.uid = Ulid::new().to_string().to_lowercase();
            created.metadata.creation_timestamp = Some(Utc::now());
            created.metadata.generation = 1;
            created.metadata.resource_version = self.next_version();
            objects.insert(key, created.clone());
        }

        self.store.counters.creates.fetch_add(1, Ordering::Relaxed);
        debug!(kind = %created.type_meta(), key = %created.key(), "Stored new object");
        self.publish(WatchEventType::Added, &created);
        Ok(created)
    }

    async fn patch(&self, object: &DynamicObject, from: &DynamicObject) -> SubstrateResult<DynamicObject> {
        validate(object)?;
        self.check(Verb::Patch, &object.kind, object.metadata.namespace.as_deref())
            .await?;

        let patch = create_merge_patch(&patchable(from)?, &patchable(object)?);
        let key = store_key(object);
        let (updated, changed) = {
            let mut objects = self.store.objects.write().await;
            let stored = objects
                .get(&key)
                .ok_or_else(|| SubstrateError::not_found(&object.kind, &key.1))?;
            if !from.metadata.resource_version.is_empty()
                && from.metadata.resource_version != stored.metadata.resource_version
            {
                return Err(SubstrateError::conflict(
                    &object.kind,
                    &key.1,
                    "the object has been modified; please apply your changes to the latest version",
                ));
            }

            let mut value = stored.to_value()?;
            apply_merge_patch(&mut value, &patch);
            let mut updated = DynamicObject::from_value(value)?;
            updated.metadata.name.clone_from(&stored.metadata.name);
            updated.metadata.namespace.clone_from(&stored.metadata.namespace);
            updated.metadata.uid.clone_from(&stored.metadata.uid);
            updated.metadata.creation_timestamp = stored.metadata.creation_timestamp;
            updated.metadata.generation = stored.metadata.generation;
            updated.metadata.resource_version.clone_from(&stored.metadata.resource_version);
            self.admit(&mut updated).await;

            let changed = &updated != stored;
            if changed {
                if updated.content_without_status() != stored.content_without_status() {
                    updated.metadata.generation = stored.metadata.generation.saturating_add(1);
                }
                updated.metadata.resource_version = self.next_version();
                objects.insert(key, updated.clone());
            }
            (updated, changed)
        };

        self.store.counters.patches.fetch_add(1, Ordering::Relaxed);
        if changed {
            self.publish(WatchEventType::Modified, &updated);
        }
        Ok(updated)
    }

    async fn update_status(&self, object: &DynamicObject) -> SubstrateResult<DynamicObject> {
        self.check(Verb::UpdateStatus, &object.kind, object.metadata.namespace.as_deref())
            .await?;

        let key = store_key(object);
        let updated = {
            let mut objects = self.store.objects.write().await;
            let stored = objects
                .get_mut(&key)
                .ok_or_else(|| SubstrateError::not_found(&object.kind, &key.1))?;
            if !object.metadata.resource_version.is_empty()
                && object.metadata.resource_version != stored.metadata.resource_version
            {
                return Err(SubstrateError::conflict(
                    &object.kind,
                    &key.1,
                    "the object has been modified; please apply your changes to the latest version",
                ));
            }
            match object.status() {
                Some(status) => stored.set_status(status.clone()),
                None => {
                    stored.data.remove("status");
                }
            }
            stored.metadata.resource_version = self.next_version();
            stored.clone()
        };

        self.store
            .counters
            .status_updates
            .fetch_add(1, Ordering::Relaxed);
        self.publish(WatchEventType::Modified, &updated);
        Ok(updated)
    }

    async fn delete(&self, type_meta: &TypeMeta, key: &ObjectKey) -> SubstrateResult<()> {
        self.check(Verb::Delete, &type_meta.kind, key.namespace.as_deref())
            .await?;

        let removed = {
            let mut objects = self.store.objects.write().await;
            let root = objects
                .remove(&(type_meta.clone(), key.clone()))
                .ok_or_else(|| SubstrateError::not_found(&type_meta.kind, key))?;

            let mut removed = vec![root];
            let mut cursor = 0;
            while let Some(owner_uid) = removed.get(cursor).map(|o| o.metadata.uid.clone()) {
                let dependents: Vec<StoreKey> = objects
                    .iter()
                    .filter(|(_, obj)| obj.metadata.is_owned_by(&owner_uid))
                    .map(|(k, _)| k.clone())
                    .collect();
                removed.extend(dependents.iter().filter_map(|k| objects.remove(k)));
                cursor = cursor.saturating_add(1);
            }
            removed
        };

        self.store.counters.deletes.fetch_add(1, Ordering::Relaxed);
        for object in &removed {
            self.publish(WatchEventType::Deleted, object);
        }
        Ok(())
    }

    fn watch(&self, type_meta: &TypeMeta) -> WatchStream {
        WatchStream::new(self.store.events.subscribe(), type_meta.clone())
    }
}

impl ClientBuilder for InMemorySubstrate {
    fn build(&self, credentials: &Credentials) -> SubstrateResult<Arc<dyn Substrate>> {
        let failure = self
            .store
            .client_error
            .read()
            .map_err(|_| SubstrateError::unavailable("client builder lock poisoned"))?
            .clone();
        match failure {
            Some(reason) => Err(SubstrateError::unavailable(reason)),
            None => Ok(Arc::new(self.impersonate(credentials.username()))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use choreo_core::ObjectMeta;
    use serde_json::json;

    fn config_map(name: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(
            &TypeMeta::new("v1", "ConfigMap"),
            ObjectMeta::namespaced("dev", name).with_label("app", "web"),
        );
        obj.data.insert("data".into(), json!({"k": "v"}));
        obj
    }

    #[tokio::test]
    async fn test_create_assigns_server_fields() {
        let substrate = InMemorySubstrate::new();
        let created = substrate.create(&config_map("a")).await.unwrap();

        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.generation, 1);
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(substrate.stats().creates, 1);

        let again = substrate.create(&config_map("a")).await;
        assert!(matches!(again, Err(SubstrateError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_generate_name() {
        let substrate = InMemorySubstrate::new();
        let mut obj = config_map("");
        obj.metadata.generate_name = "run-".into();

        let first = substrate.create(&obj).await.unwrap();
        let second = substrate.create(&obj).await.unwrap();
        assert!(first.metadata.name.starts_with("run-"));
        assert_ne!(first.metadata.name, second.metadata.name);
    }

    #[tokio::test]
    async fn test_patch_conflicts_on_stale_version() {
        let substrate = InMemorySubstrate::new();
        let created = substrate.create(&config_map("a")).await.unwrap();

        let mut desired = config_map("a");
        desired.data.insert("data".into(), json!({"k": "changed"}));
        let patched = substrate.patch(&desired, &created).await.unwrap();
        assert_eq!(patched.data.get("data"), Some(&json!({"k": "changed"})));
        assert_eq!(patched.metadata.generation, 2);

        let stale = substrate.patch(&desired, &created).await;
        assert!(stale.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_mutator_runs_on_create() {
        let substrate = InMemorySubstrate::new();
        substrate
            .add_mutator("ConfigMap", |obj| {
                obj.metadata.annotations.insert("defaulted".into(), "yes".into());
            })
            .await;
        let created = substrate.create(&config_map("a")).await.unwrap();
        assert_eq!(created.metadata.annotations.get("defaulted").map(String::as_str), Some("yes"));
    }

    #[tokio::test]
    async fn test_impersonated_client_is_denied() {
        let substrate = InMemorySubstrate::new();
        substrate
            .deny(AccessRule::deny("alice", Verb::Create, "ConfigMap"))
            .await;

        let alice = substrate.impersonate("alice");
        let err = alice.create(&config_map("a")).await.unwrap_err();
        assert!(err.is_forbidden());

        assert!(substrate.create(&config_map("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let substrate = InMemorySubstrate::new();
        let owner = substrate.create(&config_map("owner")).await.unwrap();

        let mut child = config_map("child");
        child.metadata.owner_references.push(choreo_core::OwnerReference {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "owner".into(),
            uid: owner.metadata.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        });
        substrate.create(&child).await.unwrap();

        substrate
            .delete(&owner.type_meta(), &owner.key())
            .await
            .unwrap();
        assert!(substrate.all(&owner.type_meta()).await.is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_labels() {
        let substrate = InMemorySubstrate::new();
        substrate.create(&config_map("a")).await.unwrap();
        let mut other = config_map("b");
        other.metadata.namespace = Some("prod".into());
        substrate.create(&other).await.unwrap();

        let tm = TypeMeta::new("v1", "ConfigMap");
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());

        assert_eq!(substrate.list(&tm, Some("dev"), &labels).await.unwrap().len(), 1);
        assert_eq!(substrate.list(&tm, None, &labels).await.unwrap().len(), 2);
        labels.insert("tier".to_string(), "db".to_string());
        assert!(substrate.list(&tm, None, &labels).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_sees_changes() {
        let substrate = InMemorySubstrate::new();
        let mut stream = substrate.watch(&TypeMeta::new("v1", "ConfigMap"));
        substrate.create(&config_map("a")).await.unwrap();

        let event = stream.next().await.unwrap();
        assert_eq!(event.event_type, WatchEventType::Added);
        assert_eq!(event.object.metadata.name, "a");
    }

    #[tokio::test]
    async fn test_client_builder_failure() {
        let substrate = InMemorySubstrate::new();
        let credentials = Credentials {
            service_account: "default".into(),
            namespace: "dev".into(),
            token: "t".into(),
        };
        assert!(substrate.build(&credentials).is_ok());

        substrate.set_client_error(Some("no kubeconfig".into()));
        assert!(substrate.build(&credentials).is_err());
    }
}
