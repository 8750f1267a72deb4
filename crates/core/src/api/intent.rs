//! User-authored intent kinds: `Workload`, `Deliverable` and `Runnable`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::status::{ObjectReference, OwnerStatus};
use super::GROUP_VERSION;
use crate::impl_resource;
use crate::object::{ObjectMeta, Resource};

/// A named parameter supplied by the intent author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerParam {
    pub name: String,
    pub value: Value,
}

impl OwnerParam {
    /// Create a parameter.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Spec shared by `Workload` and `Deliverable`: parameters, an optional
/// service account, and free-form fields pipelines may select on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<OwnerParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Accessors every intent kind exposes to the engine.
pub trait Owner: Resource {
    /// Parameters overriding pipeline defaults.
    fn params(&self) -> &[OwnerParam];

    /// Service account the intent asks to stamp with.
    fn service_account_name(&self) -> Option<&str>;

    /// Common status.
    fn owner_status(&self) -> &OwnerStatus;

    /// Mutable common status.
    fn owner_status_mut(&mut self) -> &mut OwnerStatus;
}

/// Something to build from source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: OwnerSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

/// Workload status: the common status plus the bound supply chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(flatten)]
    pub owner: OwnerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supply_chain_ref: Option<ObjectReference>,
}

impl_resource!(Workload, GROUP_VERSION, "Workload", namespaced);

impl Owner for Workload {
    fn params(&self) -> &[OwnerParam] {
        &self.spec.params
    }

    fn service_account_name(&self) -> Option<&str> {
        self.spec.service_account_name.as_deref()
    }

    fn owner_status(&self) -> &OwnerStatus {
        &self.status.owner
    }

    fn owner_status_mut(&mut self) -> &mut OwnerStatus {
        &mut self.status.owner
    }
}

/// Something to deploy from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deliverable {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: OwnerSpec,
    #[serde(default)]
    pub status: DeliverableStatus,
}

/// Deliverable status: the common status plus the bound delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverableStatus {
    #[serde(flatten)]
    pub owner: OwnerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_ref: Option<ObjectReference>,
}

impl_resource!(Deliverable, GROUP_VERSION, "Deliverable", namespaced);

impl Owner for Deliverable {
    fn params(&self) -> &[OwnerParam] {
        &self.spec.params
    }

    fn service_account_name(&self) -> Option<&str> {
        self.spec.service_account_name.as_deref()
    }

    fn owner_status(&self) -> &OwnerStatus {
        &self.status.owner
    }

    fn owner_status_mut(&mut self) -> &mut OwnerStatus {
        &mut self.status.owner
    }
}

/// Reference from a `Runnable` to its run template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTemplateReference {
    #[serde(default = "default_run_template_kind")]
    pub kind: String,
    pub name: String,
}

impl Default for RunTemplateReference {
    fn default() -> Self {
        Self {
            kind: default_run_template_kind(),
            name: String::new(),
        }
    }
}

fn default_run_template_kind() -> String {
    "ClusterRunTemplate".to_string()
}

/// Kind of object a `Runnable` selector looks for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceType {
    pub api_version: String,
    pub kind: String,
}

/// Picks exactly one object to expose to the run template as `selected`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    pub resource: ResourceType,
    #[serde(default)]
    pub matching_labels: BTreeMap<String, String>,
}

/// How many finished runs to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default = "default_max_runs")]
    pub max_successful_runs: usize,
    #[serde(default = "default_max_runs")]
    pub max_failed_runs: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_successful_runs: default_max_runs(),
            max_failed_runs: default_max_runs(),
        }
    }
}

const fn default_max_runs() -> usize {
    10
}

/// Runnable spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableSpec {
    pub run_template_ref: RunTemplateReference,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<ResourceSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
}

/// Runnable status: the common status plus the latest successful outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableStatus {
    #[serde(flatten)]
    pub owner: OwnerStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
}

/// A one-shot execution stamped from a `ClusterRunTemplate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Runnable {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RunnableSpec,
    #[serde(default)]
    pub status: RunnableStatus,
}

impl_resource!(Runnable, GROUP_VERSION, "Runnable", namespaced);

impl Owner for Runnable {
    fn params(&self) -> &[OwnerParam] {
        &[]
    }

    fn service_account_name(&self) -> Option<&str> {
        self.spec.service_account_name.as_deref()
    }

    fn owner_status(&self) -> &OwnerStatus {
        &self.status.owner
    }

    fn owner_status_mut(&mut self) -> &mut OwnerStatus {
        &mut self.status.owner
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::object::DynamicObject;
    use serde_json::json;

    #[test]
    fn test_workload_round_trips_free_form_fields() {
        let obj = DynamicObject::from_value(json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "Workload",
            "metadata": {"name": "w", "namespace": "dev", "labels": {"app": "web"}},
            "spec": {
                "params": [{"name": "port", "value": 8080}],
                "serviceAccountName": "builder",
                "source": {"git": {"url": "https://example.com"}}
            }
        }))
        .unwrap();

        let workload = Workload::from_dynamic(&obj).unwrap();
        assert_eq!(workload.service_account_name(), Some("builder"));
        assert_eq!(workload.params().len(), 1);
        assert!(workload.spec.fields.contains_key("source"));

        let back = workload.to_dynamic().unwrap();
        assert_eq!(back.kind, "Workload");
        assert_eq!(
            back.spec().and_then(|s| s.pointer("/source/git/url")),
            Some(&json!("https://example.com"))
        );
    }

    #[test]
    fn test_runnable_defaults() {
        let obj = DynamicObject::from_value(json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "Runnable",
            "metadata": {"name": "r", "namespace": "dev"},
            "spec": {"runTemplateRef": {"name": "tekton"}}
        }))
        .unwrap();

        let runnable = Runnable::from_dynamic(&obj).unwrap();
        assert_eq!(runnable.spec.run_template_ref.kind, "ClusterRunTemplate");
        assert_eq!(runnable.spec.retention_policy, RetentionPolicy::default());
    }

    #[test]
    fn test_from_dynamic_rejects_other_kinds() {
        let obj = DynamicObject::from_value(json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "Deliverable",
            "metadata": {"name": "d"}
        }))
        .unwrap();
        assert!(Workload::from_dynamic(&obj).is_err());
    }
}
