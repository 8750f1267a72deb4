//! Operator-authored pipelines: `ClusterSupplyChain` and `ClusterDelivery`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::selector::{OptionSelector, Selector};
use super::status::BlueprintStatus;
use super::GROUP_VERSION;
use crate::impl_resource;
use crate::object::{ObjectMeta, Resource};

/// A pipeline-level parameter default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintParam {
    pub name: String,
    pub default: Value,
}

/// One named alternative of a templateRef.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateOption {
    pub name: String,
    #[serde(default)]
    pub selector: OptionSelector,
}

/// Reference from a step to its template, by name or by options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateReference {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<TemplateOption>,
}

impl TemplateReference {
    /// Reference a single named template.
    pub fn named(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: Some(name.into()),
            options: Vec::new(),
        }
    }

    /// Every template name this reference may resolve to.
    pub fn candidate_names(&self) -> impl Iterator<Item = &str> {
        self.name
            .as_deref()
            .into_iter()
            .chain(self.options.iter().map(|o| o.name.as_str()))
    }
}

/// An input a step consumes: `from` is `<step>.<output>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInput {
    pub name: String,
    pub from: String,
}

impl StepInput {
    /// Create an input.
    pub fn new(name: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from: from.into(),
        }
    }

    /// Split `from` into `(step, output)`.
    #[must_use]
    pub fn source(&self) -> Option<(&str, &str)> {
        self.from
            .split_once('.')
            .filter(|(step, output)| !step.is_empty() && !output.is_empty())
    }
}

/// One step of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResource {
    pub name: String,
    pub template_ref: TemplateReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<StepInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<BlueprintParam>,
}

/// Service account a pipeline stamps with when the intent names none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Spec shared by both pipeline kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintSpec {
    #[serde(flatten)]
    pub selector: Selector,
    #[serde(default)]
    pub resources: Vec<PipelineResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<BlueprintParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_ref: Option<ServiceAccountRef>,
}

/// Accessors both pipeline kinds expose to the engine.
pub trait Blueprint: Resource {
    /// The pipeline spec.
    fn blueprint_spec(&self) -> &BlueprintSpec;

    /// The pipeline status.
    fn blueprint_status(&self) -> &BlueprintStatus;

    /// Mutable pipeline status.
    fn blueprint_status_mut(&mut self) -> &mut BlueprintStatus;
}

macro_rules! blueprint_kind {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            #[serde(default)]
            pub metadata: ObjectMeta,
            #[serde(default)]
            pub spec: BlueprintSpec,
            #[serde(default)]
            pub status: BlueprintStatus,
        }

        impl_resource!($name, GROUP_VERSION, $kind, cluster);

        impl Blueprint for $name {
            fn blueprint_spec(&self) -> &BlueprintSpec {
                &self.spec
            }

            fn blueprint_status(&self) -> &BlueprintStatus {
                &self.status
            }

            fn blueprint_status_mut(&mut self) -> &mut BlueprintStatus {
                &mut self.status
            }
        }
    };
}

blueprint_kind!(
    /// Pipeline for `Workload`s.
    ClusterSupplyChain,
    "ClusterSupplyChain"
);

blueprint_kind!(
    /// Pipeline for `Deliverable`s.
    ClusterDelivery,
    "ClusterDelivery"
);

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::object::DynamicObject;
    use serde_json::json;

    #[test]
    fn test_supply_chain_parses_flattened_selector() {
        let obj = DynamicObject::from_value(json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "ClusterSupplyChain",
            "metadata": {"name": "s"},
            "spec": {
                "selector": {"app": "web"},
                "selectorMatchFields": [{"key": "spec.source", "operator": "Exists"}],
                "resources": [
                    {"name": "build", "templateRef": {"kind": "ClusterSourceTemplate", "name": "git"}},
                    {
                        "name": "deploy",
                        "templateRef": {"kind": "ClusterTemplate", "name": "deploy"},
                        "inputs": [{"name": "src", "from": "build.url"}]
                    }
                ]
            }
        }))
        .unwrap();

        let chain = ClusterSupplyChain::from_dynamic(&obj).unwrap();
        assert_eq!(chain.spec.selector.predicate_count(), 2);
        assert_eq!(chain.spec.resources.len(), 2);
        let input = chain.spec.resources.get(1).and_then(|r| r.inputs.first()).unwrap();
        assert_eq!(input.source(), Some(("build", "url")));
    }

    #[test]
    fn test_step_input_source_rejects_malformed() {
        assert_eq!(StepInput::new("a", "build").source(), None);
        assert_eq!(StepInput::new("a", ".url").source(), None);
    }

    #[test]
    fn test_candidate_names_cover_options() {
        let reference = TemplateReference {
            kind: "ClusterTemplate".into(),
            name: None,
            options: vec![
                TemplateOption { name: "a".into(), selector: OptionSelector::default() },
                TemplateOption { name: "b".into(), selector: OptionSelector::default() },
            ],
        };
        assert_eq!(reference.candidate_names().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
