//! Shared fixture for the reconciler integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use choreo_core::api::{
    ClusterDelivery, ClusterSupplyChain, Deliverable, Runnable, Workload,
    SERVICE_ACCOUNT_TOKEN_TYPE,
};
use choreo_core::conditions::{self, Condition};
use choreo_core::{DynamicObject, ObjectKey, Resource, TypeMeta};
use choreo_reconciler::controller::{BlueprintReconciler, Context, OwnerReconciler};
use choreo_reconciler::{
    Action, DependencyTracker, InMemorySubstrate, Reconcile, ReconcilerConfig, Repository,
    Result, StampedTracker, SubmitCache,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const NAMESPACE: &str = "dev";

/// An in-memory substrate plus the controller context wired to it.
pub struct Fixture {
    pub substrate: InMemorySubstrate,
    pub ctx: Context,
    pub stamped_rx: mpsc::UnboundedReceiver<TypeMeta>,
}

impl Fixture {
    /// A substrate holding the `default` service account of `dev` and its token.
    pub async fn new() -> Self {
        let substrate = InMemorySubstrate::new();
        let config = ReconcilerConfig::default();
        let (tx, stamped_rx) = mpsc::unbounded_channel();
        let ctx = Context {
            repo: Repository::new(
                Arc::new(substrate.clone()),
                Arc::new(SubmitCache::with_config(&config.cache_config())),
            ),
            client_builder: Arc::new(substrate.clone()),
            tracker: Arc::new(DependencyTracker::new(config.dependency_lease())),
            stamped: Arc::new(StampedTracker::new(tx)),
            config,
        };
        let fixture = Self {
            substrate,
            ctx,
            stamped_rx,
        };
        fixture.service_account("default").await;
        fixture
    }

    /// Seed a service account with a populated token secret.
    pub async fn service_account(&self, name: &str) {
        let secret = format!("{name}-token");
        self.seed(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": secret, "namespace": NAMESPACE},
            "type": SERVICE_ACCOUNT_TOKEN_TYPE,
            "data": {"token": format!("token-of-{name}")}
        }))
        .await;
        self.seed(json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": name, "namespace": NAMESPACE},
            "secrets": [{"name": secret}]
        }))
        .await;
    }

    pub async fn seed(&self, value: Value) -> DynamicObject {
        self.substrate
            .seed(DynamicObject::from_value(value).unwrap())
            .await
            .unwrap()
    }

    pub async fn seed_typed<T: Resource>(&self, obj: &T) -> DynamicObject {
        self.substrate.seed(obj.to_dynamic().unwrap()).await.unwrap()
    }

    pub async fn delete(&self, type_meta: &TypeMeta, key: &ObjectKey) {
        use choreo_reconciler::Substrate;
        self.substrate.delete(type_meta, key).await.unwrap();
    }

    pub async fn reconcile_workload(&self, name: &str) -> Result<Action> {
        OwnerReconciler::<Workload>::new(self.ctx.clone())
            .reconcile(&ObjectKey::namespaced(NAMESPACE, name))
            .await
    }

    pub async fn reconcile_deliverable(&self, name: &str) -> Result<Action> {
        OwnerReconciler::<Deliverable>::new(self.ctx.clone())
            .reconcile(&ObjectKey::namespaced(NAMESPACE, name))
            .await
    }

    pub async fn reconcile_runnable(&self, name: &str) -> Result<Action> {
        OwnerReconciler::<Runnable>::new(self.ctx.clone())
            .reconcile(&ObjectKey::namespaced(NAMESPACE, name))
            .await
    }

    pub async fn reconcile_supply_chain(&self, name: &str) -> Result<Action> {
        BlueprintReconciler::<ClusterSupplyChain>::new(self.ctx.clone())
            .reconcile(&ObjectKey::cluster(name))
            .await
    }

    pub async fn reconcile_delivery(&self, name: &str) -> Result<Action> {
        BlueprintReconciler::<ClusterDelivery>::new(self.ctx.clone())
            .reconcile(&ObjectKey::cluster(name))
            .await
    }

    pub async fn get<T: Resource>(&self, key: &ObjectKey) -> T {
        self.ctx.repo.get::<T>(key).await.unwrap().unwrap()
    }

    pub async fn workload(&self, name: &str) -> Workload {
        self.get(&ObjectKey::namespaced(NAMESPACE, name)).await
    }

    /// Every object of a kind in the store.
    pub async fn all(&self, api_version: &str, kind: &str) -> Vec<DynamicObject> {
        self.substrate.all(&TypeMeta::new(api_version, kind)).await
    }
}

/// The condition of `type_` in `list`.
pub fn condition<'a>(list: &'a [Condition], type_: &str) -> &'a Condition {
    conditions::find(list, type_).unwrap_or_else(|| panic!("no {type_} condition in {list:?}"))
}

// ==========================================================================
// Manifests
// ==========================================================================

pub fn workload(name: &str, app: &str) -> Value {
    json!({
        "apiVersion": "carto.run/v1alpha1",
        "kind": "Workload",
        "metadata": {"name": name, "namespace": NAMESPACE, "labels": {"app": app}},
        "spec": {"source": {"git": {"url": "https://example.com/repo.git"}}}
    })
}

/// The two-step chain: `build` from a source template, `deploy` consuming
/// `build.url`.
pub fn supply_chain(name: &str, app: &str) -> Value {
    json!({
        "apiVersion": "carto.run/v1alpha1",
        "kind": "ClusterSupplyChain",
        "metadata": {"name": name},
        "spec": {
            "selector": {"app": app},
            "resources": [
                {"name": "build", "templateRef": {"kind": "ClusterSourceTemplate", "name": "git"}},
                {
                    "name": "deploy",
                    "templateRef": {"kind": "ClusterTemplate", "name": "deploy"},
                    "inputs": [{"name": "src", "from": "build.url"}]
                }
            ]
        }
    })
}

pub fn source_template() -> Value {
    json!({
        "apiVersion": "carto.run/v1alpha1",
        "kind": "ClusterSourceTemplate",
        "metadata": {"name": "git"},
        "spec": {
            "urlPath": ".status.artifact.url",
            "template": {
                "apiVersion": "source.toolkit.fluxcd.io/v1beta2",
                "kind": "GitRepository",
                "metadata": {"name": "$(workload.metadata.name)$-source"},
                "spec": {"url": "$(workload.spec.source.git.url)$"}
            }
        }
    })
}

pub fn deploy_template() -> Value {
    json!({
        "apiVersion": "carto.run/v1alpha1",
        "kind": "ClusterTemplate",
        "metadata": {"name": "deploy"},
        "spec": {
            "template": {
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "$(workload.metadata.name)$-deploy"},
                "data": {"source": "$(inputs.src)$"}
            }
        }
    })
}

pub const ARTIFACT_URL: &str = "https://artifacts.example.com/app.tar.gz";

/// Make the substrate behave like a source controller that has already
/// fetched the repository.
pub async fn publish_artifacts(fixture: &Fixture) {
    fixture
        .substrate
        .add_mutator("GitRepository", |obj: &mut DynamicObject| {
            obj.set_status(json!({"artifact": {"url": ARTIFACT_URL}}));
        })
        .await;
}

/// Seed the two templates and the chain, then reconcile the chain so it is ready.
pub async fn ready_supply_chain(fixture: &Fixture, name: &str, app: &str) {
    fixture.seed(source_template()).await;
    fixture.seed(deploy_template()).await;
    fixture.seed(supply_chain(name, app)).await;
    fixture.reconcile_supply_chain(name).await.unwrap();
}
