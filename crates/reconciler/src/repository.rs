//! Typed access to the substrate.
//!
//! Reads decode into the API types; the one write path for stamped objects
//! goes through [`SubmitCache`] so that re-submitting an unchanged desired
//! object costs no write.

use std::collections::BTreeMap;
use std::sync::Arc;

use choreo_core::api::{Secret, ServiceAccount, Template, TemplateKind};
use choreo_core::{DynamicObject, ObjectKey, Resource, TypeMeta};
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::SubmitCache;
use crate::selector::{best_matches, Candidate, Selectable, SelectorError};
use crate::substrate::{Substrate, SubstrateError};

/// Result type alias for repository operations.
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Repository error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error("unknown template kind '{kind}'")]
    UnknownTemplateKind { kind: String },

    #[error("cannot decode {kind}: {reason}")]
    Decode { kind: String, reason: String },

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error("service account '{namespace}/{service_account}': {reason}")]
    ServiceAccountSecret {
        service_account: String,
        namespace: String,
        reason: String,
    },
}

impl RepositoryError {
    fn decode(kind: impl Into<String>, e: &choreo_core::Error) -> Self {
        Self::Decode {
            kind: kind.into(),
            reason: e.to_string(),
        }
    }

    fn secret(service_account: &str, namespace: &str, reason: impl Into<String>) -> Self {
        Self::ServiceAccountSecret {
            service_account: service_account.to_string(),
            namespace: namespace.to_string(),
            reason: reason.into(),
        }
    }

    /// The substrate error underneath, if any.
    #[must_use]
    pub const fn substrate(&self) -> Option<&SubstrateError> {
        match self {
            Self::Substrate(e) => Some(e),
            _ => None,
        }
    }

    /// True when the substrate refused the call for authorization reasons.
    #[must_use]
    pub const fn is_forbidden(&self) -> bool {
        matches!(self, Self::Substrate(e) if e.is_forbidden())
    }
}

/// Typed substrate access with a shared submit cache.
#[derive(Clone)]
pub struct Repository {
    substrate: Arc<dyn Substrate>,
    cache: Arc<SubmitCache>,
}

impl Repository {
    /// Create a repository.
    pub fn new(substrate: Arc<dyn Substrate>, cache: Arc<SubmitCache>) -> Self {
        Self { substrate, cache }
    }

    /// A repository over another client (e.g. an impersonating one) that
    /// shares this repository's submit cache.
    #[must_use]
    pub fn with_substrate(&self, substrate: Arc<dyn Substrate>) -> Self {
        Self {
            substrate,
            cache: Arc::clone(&self.cache),
        }
    }

    /// The underlying client.
    #[must_use]
    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// The submit cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<SubmitCache> {
        &self.cache
    }

    /// Read an object; absent objects are `None`.
    ///
    /// # Errors
    ///
    /// Returns an error on substrate failures other than not-found, or if the
    /// object does not decode.
    pub async fn get<T: Resource>(&self, key: &ObjectKey) -> RepositoryResult<Option<T>> {
        let Some(obj) = self.get_unstructured(&T::type_meta(), key).await? else {
            return Ok(None);
        };
        T::from_dynamic(&obj)
            .map(Some)
            .map_err(|e| RepositoryError::decode(T::KIND, &e))
    }

    /// Read an object without decoding it.
    ///
    /// # Errors
    ///
    /// Returns an error on substrate failures other than not-found.
    pub async fn get_unstructured(
        &self,
        type_meta: &TypeMeta,
        key: &ObjectKey,
    ) -> RepositoryResult<Option<DynamicObject>> {
        match self.substrate.get(type_meta, key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List typed objects.
    ///
    /// # Errors
    ///
    /// Returns an error if listing fails or an object does not decode.
    pub async fn list<T: Resource>(&self, namespace: Option<&str>) -> RepositoryResult<Vec<T>> {
        self.list_unstructured(&T::type_meta(), namespace, &BTreeMap::new())
            .await?
            .iter()
            .map(|obj| T::from_dynamic(obj).map_err(|e| RepositoryError::decode(T::KIND, &e)))
            .collect()
    }

    /// List objects of any kind carrying all `labels`.
    ///
    /// # Errors
    ///
    /// Returns the substrate error if listing fails.
    pub async fn list_unstructured(
        &self,
        type_meta: &TypeMeta,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> RepositoryResult<Vec<DynamicObject>> {
        Ok(self.substrate.list(type_meta, namespace, labels).await?)
    }

    /// Read a template by its kind name. `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// An unknown kind is a misconfiguration and fails with
    /// `RepositoryError::UnknownTemplateKind`.
    pub async fn get_template(&self, kind: &str, name: &str) -> RepositoryResult<Option<Template>> {
        let template_kind = TemplateKind::from_kind(kind).ok_or_else(|| {
            RepositoryError::UnknownTemplateKind {
                kind: kind.to_string(),
            }
        })?;
        let Some(obj) = self
            .get_unstructured(&template_kind.type_meta(), &ObjectKey::cluster(name))
            .await?
        else {
            return Ok(None);
        };
        Template::from_dynamic(&obj)
            .map(Some)
            .map_err(|e| RepositoryError::decode(kind, &e))
    }

    /// Every pipeline of kind `P` that best matches `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if listing fails or any pipeline carries a malformed
    /// predicate.
    pub async fn pipelines_for<P: Resource + Candidate>(
        &self,
        target: &Selectable<'_>,
    ) -> RepositoryResult<Vec<P>> {
        let all = self.list::<P>(None).await?;
        let matched = best_matches(target, &all)?;
        debug!(kind = P::KIND, candidates = all.len(), matched = matched.len(), "Selected pipelines");
        Ok(matched.into_iter().cloned().collect())
    }

    /// Create or patch `desired` so that the substrate holds it. On return
    /// `desired` is the object as persisted.
    ///
    /// # Errors
    ///
    /// Returns the substrate error if listing, creating or patching fails.
    pub async fn ensure_mutable(&self, desired: &mut DynamicObject) -> RepositoryResult<()> {
        self.ensure_exists(desired, true).await
    }

    /// Create `desired` unless an identical submission already produced a
    /// live object. Never patches.
    ///
    /// # Errors
    ///
    /// Returns the substrate error if listing or creating fails.
    pub async fn ensure_immutable(&self, desired: &mut DynamicObject) -> RepositoryResult<()> {
        self.ensure_exists(desired, false).await
    }

    async fn ensure_exists(&self, desired: &mut DynamicObject, allow_update: bool) -> RepositoryResult<()> {
        let type_meta = desired.type_meta();
        let candidates = self
            .substrate
            .list(&type_meta, desired.metadata.namespace.as_deref(), &desired.metadata.labels)
            .await?;

        if let Some(live) = self.cache.unchanged_since_from_list(desired, &candidates) {
            debug!(kind = %type_meta, key = %live.key(), "Desired object unchanged since last submission");
            *desired = live;
            return Ok(());
        }

        let submitted = desired.clone();
        let existing = if allow_update && !desired.metadata.name.is_empty() {
            match candidates.into_iter().find(|c| c.metadata.name == desired.metadata.name) {
                Some(found) => Some(found),
                None => self.get_unstructured(&type_meta, &desired.key()).await?,
            }
        } else {
            None
        };

        let persisted = match existing {
            Some(existing) => {
                info!(kind = %type_meta, key = %existing.key(), "Patching object");
                self.substrate.patch(desired, &existing).await?
            }
            None => {
                info!(kind = %type_meta, name = desired.metadata.name_or_generate_name(), "Creating object");
                self.substrate.create(desired).await?
            }
        };

        self.cache.set(&submitted, &persisted);
        *desired = persisted;
        Ok(())
    }

    /// Write the status subresource of `obj`. Conflicts surface as-is.
    ///
    /// # Errors
    ///
    /// Returns the substrate error, including optimistic concurrency conflicts.
    pub async fn status_update<T: Resource>(&self, obj: &T) -> RepositoryResult<T> {
        let dynamic = obj
            .to_dynamic()
            .map_err(|e| RepositoryError::decode(T::KIND, &e))?;
        let updated = self.substrate.update_status(&dynamic).await?;
        T::from_dynamic(&updated).map_err(|e| RepositoryError::decode(T::KIND, &e))
    }

    /// Delete an object; already gone is success.
    ///
    /// # Errors
    ///
    /// Returns the substrate error on other failures.
    pub async fn delete(&self, obj: &DynamicObject) -> RepositoryResult<()> {
        match self.substrate.delete(&obj.type_meta(), &obj.key()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The token secret bound to a service account.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::ServiceAccountSecret` if the account or a
    /// populated token secret cannot be found.
    pub async fn service_account_secret(&self, service_account: &str, namespace: &str) -> RepositoryResult<Secret> {
        let account = self
            .get::<ServiceAccount>(&ObjectKey::namespaced(namespace, service_account))
            .await
            .map_err(|e| RepositoryError::secret(service_account, namespace, e.to_string()))?
            .ok_or_else(|| RepositoryError::secret(service_account, namespace, "service account not found"))?;

        for reference in &account.secrets {
            let secret = self
                .get::<Secret>(&ObjectKey::namespaced(namespace, &reference.name))
                .await
                .map_err(|e| RepositoryError::secret(service_account, namespace, e.to_string()))?;
            if let Some(secret) = secret.filter(|s| s.service_account_token().is_some()) {
                return Ok(secret);
            }
        }

        Err(RepositoryError::secret(
            service_account,
            namespace,
            "found no secret of type 'kubernetes.io/service-account-token' with a token",
        ))
    }
}
