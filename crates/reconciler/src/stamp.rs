//! Template stamping.
//!
//! String values in a template body may carry `$(<path>)$` tags. A string
//! that is exactly one tag becomes the typed value found at the path; tags
//! embedded in longer strings are rendered (strings verbatim, everything else
//! as JSON). A tag that finds nothing, or finds `null`, is an error.

use std::collections::BTreeMap;

use choreo_core::{DynamicObject, JsonPath, OwnerReference};
use serde_json::{Map, Value};
use thiserror::Error;

const TAG_OPEN: &str = "$(";
const TAG_CLOSE: &str = ")$";

/// A template body that cannot be turned into an object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StampError {
    #[error("unable to evaluate '{expression}' at {field}: {reason}")]
    Interpolation {
        field: String,
        expression: String,
        reason: String,
    },

    #[error("stamped object is invalid: {reason}")]
    InvalidObject { reason: String },

    #[error("stamped object sets namespace '{stamped}' but its owner lives in '{owner}'")]
    ForeignNamespace { stamped: String, owner: String },
}

impl StampError {
    fn interpolation(field: &str, expression: &str, reason: impl Into<String>) -> Self {
        Self::Interpolation {
            field: if field.is_empty() { "/".to_string() } else { field.to_string() },
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidObject {
            reason: reason.into(),
        }
    }
}

/// Stamps template bodies against one context.
#[derive(Debug, Clone, Copy)]
pub struct Stamper<'a> {
    context: &'a Value,
}

impl<'a> Stamper<'a> {
    #[must_use]
    pub const fn new(context: &'a Value) -> Self {
        Self { context }
    }

    /// Interpolate `body` and parse the result as an object.
    ///
    /// # Errors
    ///
    /// Returns an error if a tag cannot be resolved or the result lacks
    /// `apiVersion` or `kind`.
    pub fn stamp(&self, body: &Value) -> Result<DynamicObject, StampError> {
        let value = self.interpolate(body, "")?;
        let obj = DynamicObject::from_value(value).map_err(|e| StampError::invalid(e.to_string()))?;
        if obj.api_version.is_empty() || obj.kind.is_empty() {
            return Err(StampError::invalid("apiVersion and kind are required"));
        }
        Ok(obj)
    }

    /// Interpolate every string under `value`. `pointer` is the JSON pointer
    /// of `value` within the body.
    ///
    /// # Errors
    ///
    /// Returns an error naming the field and expression of the first tag that
    /// cannot be resolved.
    pub fn interpolate(&self, value: &Value, pointer: &str) -> Result<Value, StampError> {
        match value {
            Value::String(s) => self.interpolate_string(s, pointer),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.interpolate(item, &format!("{pointer}/{i}")))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => fields
                .iter()
                .map(|(k, v)| {
                    let child = format!("{pointer}/{}", escape_pointer(k));
                    self.interpolate(v, &child).map(|v| (k.clone(), v))
                })
                .collect::<Result<Map<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn interpolate_string(&self, s: &str, pointer: &str) -> Result<Value, StampError> {
        let tags = scan_tags(s);
        if tags.is_empty() {
            return Ok(Value::String(s.to_string()));
        }

        if let [only] = tags.as_slice() {
            if only.start == 0 && only.end == s.len() {
                return self.lookup(only.expression, pointer).cloned();
            }
        }

        let mut rendered = String::with_capacity(s.len());
        let mut cursor = 0;
        for tag in &tags {
            rendered.push_str(s.get(cursor..tag.start).unwrap_or_default());
            match self.lookup(tag.expression, pointer)? {
                Value::String(text) => rendered.push_str(text),
                other => rendered.push_str(&other.to_string()),
            }
            cursor = tag.end;
        }
        rendered.push_str(s.get(cursor..).unwrap_or_default());
        Ok(Value::String(rendered))
    }

    fn lookup(&self, expression: &str, pointer: &str) -> Result<&'a Value, StampError> {
        let path = JsonPath::parse(expression)
            .map_err(|e| StampError::interpolation(pointer, expression, e.to_string()))?;
        let value = path
            .evaluate_single(self.context)
            .map_err(|e| StampError::interpolation(pointer, expression, e.to_string()))?;
        if value.is_null() {
            return Err(StampError::interpolation(pointer, expression, "value is null"));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag<'s> {
    start: usize,
    end: usize,
    expression: &'s str,
}

/// Find `$(...)$` tags. An opening marker without a close is literal text.
fn scan_tags(s: &str) -> Vec<Tag<'_>> {
    let mut tags = Vec::new();
    let mut offset = 0;
    while let Some(rest) = s.get(offset..) {
        let Some(open) = rest.find(TAG_OPEN) else {
            break;
        };
        let body_start = offset.saturating_add(open).saturating_add(TAG_OPEN.len());
        let Some(close) = s.get(body_start..).and_then(|tail| tail.find(TAG_CLOSE)) else {
            break;
        };
        let body_end = body_start.saturating_add(close);
        let end = body_end.saturating_add(TAG_CLOSE.len());
        tags.push(Tag {
            start: offset.saturating_add(open),
            end,
            expression: s.get(body_start..body_end).unwrap_or_default().trim(),
        });
        offset = end;
    }
    tags
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Set the owner reference, namespace and provenance labels of a stamped
/// object. Provenance labels win over labels the template set.
///
/// # Errors
///
/// Returns `StampError::ForeignNamespace` if the template placed the object
/// in a namespace other than `namespace`.
pub fn apply_provenance(
    obj: &mut DynamicObject,
    owner: OwnerReference,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Result<(), StampError> {
    if let Some(stamped) = obj
        .metadata
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty() && *ns != namespace)
    {
        return Err(StampError::ForeignNamespace {
            stamped: stamped.to_string(),
            owner: namespace.to_string(),
        });
    }
    obj.metadata.namespace = Some(namespace.to_string());

    obj.metadata
        .owner_references
        .retain(|r| r.uid != owner.uid && r.controller != Some(true));
    obj.metadata.owner_references.push(owner);
    obj.metadata
        .labels
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "workload": {
                "metadata": {"name": "app", "namespace": "dev"},
                "spec": {"source": {"git": {"url": "https://example.com/app.git"}}, "replicas": 3}
            },
            "params": {"registry": "registry.local", "empty": null},
            "inputs": {"src": "https://artifacts/app.tgz"}
        })
    }

    #[test]
    fn test_whole_string_tag_keeps_type() {
        let ctx = context();
        let stamper = Stamper::new(&ctx);
        let out = stamper
            .interpolate(&json!({"replicas": "$(workload.spec.replicas)$"}), "")
            .unwrap();
        assert_eq!(out, json!({"replicas": 3}));
    }

    #[test]
    fn test_embedded_tags_are_rendered() {
        let ctx = context();
        let stamper = Stamper::new(&ctx);
        let out = stamper
            .interpolate(
                &json!("$(params.registry)$/$(workload.metadata.name)$:$(workload.spec.replicas)$"),
                "",
            )
            .unwrap();
        assert_eq!(out, json!("registry.local/app:3"));
    }

    #[test]
    fn test_objects_are_rendered_as_json_when_embedded() {
        let ctx = context();
        let stamper = Stamper::new(&ctx);
        let out = stamper.interpolate(&json!("git=$(workload.spec.source.git)$"), "").unwrap();
        assert_eq!(out, json!(r#"git={"url":"https://example.com/app.git"}"#));
    }

    #[test]
    fn test_missing_value_names_field() {
        let ctx = context();
        let stamper = Stamper::new(&ctx);
        let err = stamper
            .interpolate(&json!({"spec": {"image": "$(inputs.image)$"}}), "")
            .unwrap_err();
        match err {
            StampError::Interpolation { field, expression, .. } => {
                assert_eq!(field, "/spec/image");
                assert_eq!(expression, "inputs.image");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_null_value_is_error() {
        let ctx = context();
        let stamper = Stamper::new(&ctx);
        assert!(stamper.interpolate(&json!(["$(params.empty)$"]), "").is_err());
    }

    #[test]
    fn test_unclosed_tag_is_literal() {
        let ctx = context();
        let stamper = Stamper::new(&ctx);
        let out = stamper.interpolate(&json!("cost $(5"), "").unwrap();
        assert_eq!(out, json!("cost $(5"));
    }

    #[test]
    fn test_stamp_requires_kind() {
        let ctx = context();
        let stamper = Stamper::new(&ctx);
        let err = stamper
            .stamp(&json!({"apiVersion": "v1", "metadata": {"name": "x"}}))
            .unwrap_err();
        assert!(matches!(err, StampError::InvalidObject { .. }));
    }

    #[test]
    fn test_stamp_produces_object() {
        let ctx = context();
        let stamper = Stamper::new(&ctx);
        let obj = stamper
            .stamp(&json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "$(workload.metadata.name)$-config"},
                "data": {"url": "$(inputs.src)$"}
            }))
            .unwrap();
        assert_eq!(obj.metadata.name, "app-config");
        assert_eq!(obj.data.get("data"), Some(&json!({"url": "https://artifacts/app.tgz"})));
    }

    #[test]
    fn test_provenance_labels_win_and_owner_is_set() {
        let mut obj = DynamicObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "x", "labels": {"carto.run/workload-name": "spoofed", "team": "a"}}
        }))
        .unwrap();
        let owner = OwnerReference {
            api_version: "carto.run/v1alpha1".into(),
            kind: "Workload".into(),
            name: "app".into(),
            uid: "uid-1".into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let labels = BTreeMap::from([("carto.run/workload-name".to_string(), "app".to_string())]);

        apply_provenance(&mut obj, owner, "dev", &labels).unwrap();
        assert_eq!(obj.metadata.namespace.as_deref(), Some("dev"));
        assert_eq!(obj.metadata.labels.get("carto.run/workload-name").map(String::as_str), Some("app"));
        assert_eq!(obj.metadata.labels.get("team").map(String::as_str), Some("a"));
        assert_eq!(obj.metadata.owner_references.len(), 1);
    }

    #[test]
    fn test_foreign_namespace_rejected() {
        let mut obj = DynamicObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "x", "namespace": "prod"}
        }))
        .unwrap();
        let owner = OwnerReference {
            api_version: "carto.run/v1alpha1".into(),
            kind: "Workload".into(),
            name: "app".into(),
            uid: "uid-1".into(),
            controller: Some(true),
            block_owner_deletion: None,
        };
        let result = apply_provenance(&mut obj, owner, "dev", &BTreeMap::new());
        assert!(matches!(result, Err(StampError::ForeignNamespace { .. })));
    }
}
