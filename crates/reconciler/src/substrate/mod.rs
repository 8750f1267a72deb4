//! The orchestration substrate the engine reads and writes.
//!
//! The engine depends only on [`Substrate`]: typed get/list, create, patch
//! with optimistic concurrency, a status subresource, delete, and a watch
//! stream per kind. [`InMemorySubstrate`] is the implementation the tests and
//! the binary run against.

mod error;
mod memory;
pub mod patch;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use choreo_core::{DynamicObject, ObjectKey, TypeMeta};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

pub use error::{SubstrateError, SubstrateResult};
pub use memory::{AccessRule, InMemorySubstrate, SubstrateStats};

/// Operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Patch,
    UpdateStatus,
    Delete,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Create => "create",
            Self::Patch => "patch",
            Self::UpdateStatus => "update status of",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// One change observed on the substrate.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: DynamicObject,
}

/// Stream of changes to one kind.
pub struct WatchStream {
    receiver: broadcast::Receiver<WatchEvent>,
    type_meta: TypeMeta,
}

impl WatchStream {
    /// Wrap a broadcast receiver, keeping only events of `type_meta`.
    #[must_use]
    pub const fn new(receiver: broadcast::Receiver<WatchEvent>, type_meta: TypeMeta) -> Self {
        Self {
            receiver,
            type_meta,
        }
    }

    /// The kind this stream follows.
    #[must_use]
    pub const fn type_meta(&self) -> &TypeMeta {
        &self.type_meta
    }

    /// Next event for the watched kind; `None` once the substrate is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.object.kind == self.type_meta.kind
                    && event.object.api_version == self.type_meta.api_version =>
                {
                    return Some(event);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(kind = %self.type_meta, skipped, "Watch lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// CRUD+watch API over typed objects.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Read one object.
    async fn get(&self, type_meta: &TypeMeta, key: &ObjectKey) -> SubstrateResult<DynamicObject>;

    /// List objects of a kind, optionally in one namespace, carrying all `labels`.
    async fn list(
        &self,
        type_meta: &TypeMeta,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> SubstrateResult<Vec<DynamicObject>>;

    /// Create an object; `generateName` is resolved by the substrate.
    async fn create(&self, object: &DynamicObject) -> SubstrateResult<DynamicObject>;

    /// Merge-patch `from` into `object`. Fails with a conflict when
    /// `from`'s resourceVersion is stale.
    async fn patch(&self, object: &DynamicObject, from: &DynamicObject) -> SubstrateResult<DynamicObject>;

    /// Write the status subresource.
    async fn update_status(&self, object: &DynamicObject) -> SubstrateResult<DynamicObject>;

    /// Delete an object and, through owner references, its dependents.
    async fn delete(&self, type_meta: &TypeMeta, key: &ObjectKey) -> SubstrateResult<()>;

    /// Follow changes to one kind.
    fn watch(&self, type_meta: &TypeMeta) -> WatchStream;
}

/// Service account identity a stamping client acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub service_account: String,
    pub namespace: String,
    pub token: String,
}

impl Credentials {
    /// The user name the substrate authorizes.
    #[must_use]
    pub fn username(&self) -> String {
        format!(
            "system:serviceaccount:{}:{}",
            self.namespace, self.service_account
        )
    }
}

/// Builds substrate clients that impersonate a service account.
pub trait ClientBuilder: Send + Sync {
    /// Build a client for `credentials`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be constructed.
    fn build(&self, credentials: &Credentials) -> SubstrateResult<Arc<dyn Substrate>>;
}

/// A wrapper that adds tracing to a substrate.
pub struct TracingSubstrate<S: Substrate> {
    inner: S,
}

impl<S: Substrate> TracingSubstrate<S> {
    /// Create a new tracing substrate.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: Substrate> Substrate for TracingSubstrate<S> {
    async fn get(&self, type_meta: &TypeMeta, key: &ObjectKey) -> SubstrateResult<DynamicObject> {
        debug!(kind = %type_meta, key = %key, "Getting object");
        self.inner.get(type_meta, key).await
    }

    async fn list(
        &self,
        type_meta: &TypeMeta,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> SubstrateResult<Vec<DynamicObject>> {
        debug!(kind = %type_meta, namespace = ?namespace, labels = ?labels, "Listing objects");
        self.inner.list(type_meta, namespace, labels).await
    }

    async fn create(&self, object: &DynamicObject) -> SubstrateResult<DynamicObject> {
        debug!(kind = %object.type_meta(), name = object.metadata.name_or_generate_name(), "Creating object");
        let result = self.inner.create(object).await;
        if let Ok(ref created) = result {
            tracing::trace!(key = %created.key(), version = %created.metadata.resource_version, "Object created");
        }
        result
    }

    async fn patch(&self, object: &DynamicObject, from: &DynamicObject) -> SubstrateResult<DynamicObject> {
        debug!(kind = %object.type_meta(), key = %object.key(), "Patching object");
        self.inner.patch(object, from).await
    }

    async fn update_status(&self, object: &DynamicObject) -> SubstrateResult<DynamicObject> {
        debug!(kind = %object.type_meta(), key = %object.key(), "Updating status");
        self.inner.update_status(object).await
    }

    async fn delete(&self, type_meta: &TypeMeta, key: &ObjectKey) -> SubstrateResult<()> {
        debug!(kind = %type_meta, key = %key, "Deleting object");
        self.inner.delete(type_meta, key).await
    }

    fn watch(&self, type_meta: &TypeMeta) -> WatchStream {
        debug!(kind = %type_meta, "Starting watch");
        self.inner.watch(type_meta)
    }
}
