//! Reading outputs from stamped children.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use choreo_core::api::ResourceOutput;
use choreo_core::conditions::ConditionStatus;
use choreo_core::{DynamicObject, JsonPath};
use serde_json::Value;
use sha2::{Digest, Sha256};

const PREVIEW_LIMIT: usize = 1024;

/// Condition a run reports when it has finished.
pub const SUCCEEDED: &str = "Succeeded";

/// Outputs of one step, by alias.
pub type Outputs = BTreeMap<String, Value>;

/// An output expression that could not be read from a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadOutput {
    pub expression: String,
    pub reason: String,
}

/// Evaluate every output expression against `child`.
///
/// # Errors
///
/// Returns the first expression that does not resolve to exactly one value.
pub fn read_outputs(child: &DynamicObject, paths: &BTreeMap<String, String>) -> Result<Outputs, UnreadOutput> {
    let root = child.to_value().map_err(|e| UnreadOutput {
        expression: String::new(),
        reason: e.to_string(),
    })?;
    paths
        .iter()
        .map(|(alias, expression)| {
            JsonPath::parse(expression)
                .and_then(|path| path.evaluate_single(&root).cloned())
                .map(|value| (alias.clone(), value))
                .map_err(|e| UnreadOutput {
                    expression: expression.clone(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

/// Children ordered newest first.
#[must_use]
pub fn newest_first(children: &[DynamicObject]) -> Vec<&DynamicObject> {
    let mut sorted: Vec<&DynamicObject> = children.iter().collect();
    sorted.sort_by(|a, b| {
        b.metadata
            .creation_timestamp
            .cmp(&a.metadata.creation_timestamp)
            .then_with(|| b.metadata.name.cmp(&a.metadata.name))
    });
    sorted
}

/// A condition as a child reports it. Children written by other controllers
/// need not carry a transition time, so only type, status and message are read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedCondition {
    pub status: ConditionStatus,
    pub message: String,
}

/// The condition of `type_` in a child's `status.conditions`. A status other
/// than `True` or `False` reads as `Unknown`.
#[must_use]
pub fn observed_condition(child: &DynamicObject, type_: &str) -> Option<ObservedCondition> {
    let field = |entry: &Value, name: &str| entry.get(name).and_then(Value::as_str).map(str::to_string);
    child
        .status()?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|entry| field(entry, "type").as_deref() == Some(type_))
        .map(|entry| ObservedCondition {
            status: match field(entry, "status").as_deref() {
                Some("True") => ConditionStatus::True,
                Some("False") => ConditionStatus::False,
                _ => ConditionStatus::Unknown,
            },
            message: field(entry, "message").unwrap_or_default(),
        })
}

/// Status of a child's `Succeeded` condition, if it reports one.
#[must_use]
pub fn succeeded(child: &DynamicObject) -> Option<ConditionStatus> {
    observed_condition(child, SUCCEEDED).map(|c| c.status)
}

/// `sha256:<hex>` of the YAML rendering of `value`.
#[must_use]
pub fn digest(value: &Value) -> String {
    let rendered = render(value);
    format!("sha256:{:x}", Sha256::digest(rendered.as_bytes()))
}

/// YAML rendering capped at 1024 characters.
#[must_use]
pub fn preview(value: &Value) -> String {
    render(value).chars().take(PREVIEW_LIMIT).collect()
}

fn render(value: &Value) -> String {
    serde_yaml::to_string(value).unwrap_or_else(|_| value.to_string())
}

/// Status entries for `outputs`. Each keeps its previous transition time
/// while its digest is unchanged.
#[must_use]
pub fn to_status(outputs: &Outputs, previous: &[ResourceOutput], now: DateTime<Utc>) -> Vec<ResourceOutput> {
    outputs
        .iter()
        .map(|(name, value)| {
            let digest = digest(value);
            let last_transition_time = previous
                .iter()
                .find(|p| &p.name == name && p.digest == digest)
                .map_or(now, |p| p.last_transition_time);
            ResourceOutput {
                name: name.clone(),
                preview: preview(value),
                digest,
                last_transition_time,
            }
        })
        .collect()
}
