//! Object model shared by every kind the engine reads or writes.
//!
//! Typed API objects implement [`Resource`]; anything the engine stamps from a
//! template travels as a [`DynamicObject`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::result::Result;

/// `apiVersion` + `kind` pair identifying a kind on the substrate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    pub api_version: String,
    pub kind: String,
}

impl TypeMeta {
    /// Create a new type meta.
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// API group, empty for the core group.
    #[must_use]
    pub fn group(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map_or("", |(group, _)| group)
    }
}

impl fmt::Display for TypeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.to_lowercase();
        match self.group() {
            "" => write!(f, "{kind}"),
            group => write!(f, "{kind}.{group}"),
        }
    }
}

/// Reference from a child to the object that controls it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

/// Standard object metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl ObjectMeta {
    /// Metadata for a named object in a namespace.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    /// Metadata for a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder-style label setter.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// The name, or the generate-name prefix when the server has yet to assign one.
    #[must_use]
    pub fn name_or_generate_name(&self) -> &str {
        if self.name.is_empty() {
            &self.generate_name
        } else {
            &self.name
        }
    }

    /// True when some owner reference points at `uid`.
    #[must_use]
    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owner_references.iter().any(|o| o.uid == uid)
    }

    /// The controlling owner, if any.
    #[must_use]
    pub fn controller(&self) -> Option<&OwnerReference> {
        self.owner_references
            .iter()
            .find(|o| o.controller == Some(true))
    }

    /// True when every entry of `selector` is present in the labels.
    #[must_use]
    pub fn has_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// `(namespace, name)` identity of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Unstructured object: type meta, metadata, and every other top-level field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicObject {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl DynamicObject {
    /// Create an empty object of the given type.
    pub fn new(type_meta: &TypeMeta, metadata: ObjectMeta) -> Self {
        Self {
            api_version: type_meta.api_version.clone(),
            kind: type_meta.kind.clone(),
            metadata,
            data: Map::new(),
        }
    }

    /// The object's type.
    #[must_use]
    pub fn type_meta(&self) -> TypeMeta {
        TypeMeta::new(self.api_version.clone(), self.kind.clone())
    }

    /// The object's `(namespace, name)` key.
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    /// The `spec` subtree.
    #[must_use]
    pub fn spec(&self) -> Option<&Value> {
        self.data.get("spec")
    }

    /// The `status` subtree.
    #[must_use]
    pub fn status(&self) -> Option<&Value> {
        self.data.get("status")
    }

    /// Replace the `status` subtree.
    pub fn set_status(&mut self, status: Value) {
        self.data.insert("status".to_string(), status);
    }

    /// Everything but the status and metadata, used to compare desired forms.
    #[must_use]
    pub fn content_without_status(&self) -> Map<String, Value> {
        self.data
            .iter()
            .filter(|(k, _)| k.as_str() != "status")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Render as a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the object cannot be serialized.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an object.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::invalid_object("unknown", "expected a JSON object"));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Parse every document of a multi-document YAML stream.
    ///
    /// # Errors
    ///
    /// Returns an error if a document is not a valid object.
    pub fn from_yaml_documents(input: &str) -> Result<Vec<Self>> {
        serde_yaml::Deserializer::from_str(input)
            .map(|document| Value::deserialize(document).map_err(Error::from))
            .filter(|value| !matches!(value, Ok(Value::Null)))
            .map(|value| value.and_then(Self::from_value))
            .collect()
    }
}

/// A typed API object that can travel through the substrate.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// `apiVersion` of the kind.
    const API_VERSION: &'static str;
    /// Kind name.
    const KIND: &'static str;
    /// Whether objects of this kind live in a namespace.
    const NAMESPACED: bool;

    /// Object metadata.
    fn metadata(&self) -> &ObjectMeta;

    /// Mutable object metadata.
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Type meta of the kind.
    #[must_use]
    fn type_meta() -> TypeMeta {
        TypeMeta::new(Self::API_VERSION, Self::KIND)
    }

    /// The object's name.
    fn name(&self) -> &str {
        &self.metadata().name
    }

    /// The object's namespace, empty for cluster-scoped kinds.
    fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// The object's `(namespace, name)` key.
    fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.metadata().namespace.clone(),
            name: self.metadata().name.clone(),
        }
    }

    /// Owner reference pointing at this object as controller.
    fn controller_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            name: self.metadata().name.clone(),
            uid: self.metadata().uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Convert into an unstructured object.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn to_dynamic(&self) -> Result<DynamicObject> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("apiVersion".into(), Value::from(Self::API_VERSION));
            map.insert("kind".into(), Value::from(Self::KIND));
        }
        DynamicObject::from_value(value)
    }

    /// Convert from an unstructured object.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind differs or the body does not fit the type.
    fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        if obj.kind != Self::KIND {
            return Err(Error::kind_mismatch(Self::KIND, obj.kind.clone()));
        }
        serde_json::from_value(obj.to_value()?)
            .map_err(|e| Error::invalid_object(Self::KIND, e.to_string()))
    }
}

/// Implement [`Resource`] for a struct with a `metadata: ObjectMeta` field.
#[macro_export]
macro_rules! impl_resource {
    ($ty:ty, $api_version:expr, $kind:expr, namespaced) => {
        $crate::impl_resource!(@impl $ty, $api_version, $kind, true);
    };
    ($ty:ty, $api_version:expr, $kind:expr, cluster) => {
        $crate::impl_resource!(@impl $ty, $api_version, $kind, false);
    };
    (@impl $ty:ty, $api_version:expr, $kind:expr, $namespaced:expr) => {
        impl $crate::object::Resource for $ty {
            const API_VERSION: &'static str = $api_version;
            const KIND: &'static str = $kind;
            const NAMESPACED: bool = $namespaced;

            fn metadata(&self) -> &$crate::object::ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut $crate::object::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}
