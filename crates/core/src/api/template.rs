//! Template kinds: one per output axis, plus the run template.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{SelectorRequirement, GROUP_VERSION};
use crate::conditions::ConditionStatus;
use crate::error::Error;
use crate::impl_resource;
use crate::object::{DynamicObject, ObjectMeta, TypeMeta};
use crate::result::Result;

/// The template kinds a pipeline step may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TemplateKind {
    Source,
    Image,
    Config,
    Deployment,
    Plain,
}

impl TemplateKind {
    /// Every step template kind.
    pub const ALL: [Self; 5] = [
        Self::Source,
        Self::Image,
        Self::Config,
        Self::Deployment,
        Self::Plain,
    ];

    /// Kind name on the substrate.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "ClusterSourceTemplate",
            Self::Image => "ClusterImageTemplate",
            Self::Config => "ClusterConfigTemplate",
            Self::Deployment => "ClusterDeploymentTemplate",
            Self::Plain => "ClusterTemplate",
        }
    }

    /// Parse a kind name; `None` for anything that is not a step template.
    #[must_use]
    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// Type meta of the kind.
    #[must_use]
    pub fn type_meta(self) -> TypeMeta {
        TypeMeta::new(GROUP_VERSION, self.as_str())
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether stamped objects are patched in place or replaced by new ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Mutable,
    Immutable,
}

impl Lifecycle {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mutable => "mutable",
            Self::Immutable => "immutable",
        }
    }
}

/// A template-level parameter default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateParam {
    pub name: String,
    #[serde(default)]
    pub default: Value,
}

/// A condition the stamped object must report with a given status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionRequirement {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
}

/// A field predicate on the stamped object, with a path to the message
/// reported when it decides health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMatchFieldRequirement {
    #[serde(flatten)]
    pub requirement: SelectorRequirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_path: Option<String>,
}

/// Conditions and fields read from the stamped object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMatchRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<ConditionRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<HealthMatchFieldRequirement>,
}

/// Healthy when every `healthy` requirement holds, unhealthy when any
/// `unhealthy` requirement holds. Unhealthy is checked first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiMatchHealthRule {
    #[serde(default)]
    pub healthy: HealthMatchRule,
    #[serde(default)]
    pub unhealthy: HealthMatchRule,
}

/// How the health of a stamped object is judged. One of the three rules is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always_healthy: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_condition_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_match: Option<MultiMatchHealthRule>,
}

/// Body plus output expressions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<TemplateParam>,
    /// Output alias to path into the stamped child.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_rule: Option<HealthRule>,
}

impl TemplateSpec {
    /// All output expressions, the typed path fields under their conventional
    /// aliases (`url`, `revision`, `image`, `config`) plus the `outputs` map.
    #[must_use]
    pub fn output_paths(&self) -> BTreeMap<String, String> {
        let typed = [
            ("url", &self.url_path),
            ("revision", &self.revision_path),
            ("image", &self.image_path),
            ("config", &self.config_path),
        ];
        typed
            .into_iter()
            .filter_map(|(alias, path)| path.as_ref().map(|p| (alias.to_string(), p.clone())))
            .chain(self.outputs.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}

/// A step template of any kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub kind: TemplateKind,
    pub metadata: ObjectMeta,
    pub spec: TemplateSpec,
}

impl Template {
    /// Read a template from an unstructured object.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is not a template kind or the spec is malformed.
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        let kind = TemplateKind::from_kind(&obj.kind)
            .ok_or_else(|| Error::kind_mismatch("a template kind", obj.kind.clone()))?;
        let spec = match obj.spec() {
            Some(spec) => serde_json::from_value(spec.clone())
                .map_err(|e| Error::invalid_object(kind.as_str(), e.to_string()))?,
            None => TemplateSpec::default(),
        };
        Ok(Self {
            kind,
            metadata: obj.metadata.clone(),
            spec,
        })
    }

    /// The template name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Spec of a `ClusterRunTemplate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTemplateSpec {
    pub template: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

/// Body a `Runnable` stamps each time its inputs change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterRunTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RunTemplateSpec,
}

impl_resource!(ClusterRunTemplate, GROUP_VERSION, "ClusterRunTemplate", cluster);
