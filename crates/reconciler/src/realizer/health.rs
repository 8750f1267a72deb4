//! Health of stamped objects.
//!
//! Each step reports a `Healthy` condition judged by its template's health
//! rule. Without a rule, a step is healthy once it has outputs, and a plain
//! `ClusterTemplate` step is healthy once its object is stamped. The owner
//! folds the step conditions into `ResourcesHealthy`.

use choreo_core::api::{HealthMatchFieldRequirement, HealthMatchRule, HealthRule, RealizedResource, TemplateKind};
use choreo_core::conditions::{self, Condition, ConditionManager, ConditionStatus};
use choreo_core::eval::evaluate;
use choreo_core::{DynamicObject, ResultExt};
use serde_json::Value;

use super::outputs::observed_condition;
use crate::selector::field_requirement_matches;

/// Per-step health condition.
pub const HEALTHY: &str = "Healthy";
/// Owner-level fold of every step's `Healthy`.
pub const RESOURCES_HEALTHY: &str = "ResourcesHealthy";
/// Reason of `ResourcesHealthy`, whatever its status.
pub const HEALTHY_CONDITION_RULE: &str = "HealthyConditionRule";

pub const OUTPUTS_AVAILABLE: &str = "OutputsAvailable";
pub const OUTPUT_NOT_AVAILABLE: &str = "OutputNotAvailable";
pub const ALWAYS_HEALTHY: &str = "AlwaysHealthy";
pub const NO_STAMPED_OBJECT: &str = "NoStampedObject";
pub const NO_MATCHES_FULFILLED: &str = "NoMatchesFulfilled";
pub const MATCHED_CONDITION: &str = "MatchedCondition";
pub const MATCHED_FIELD: &str = "MatchedField";
const UNKNOWN: &str = "Unknown";

fn healthy(status: ConditionStatus, reason: impl Into<String>) -> Condition {
    Condition::new(HEALTHY, status, reason)
}

/// The `Healthy` condition of one step.
#[must_use]
pub fn determine(rule: Option<&HealthRule>, resource: &RealizedResource, stamped: Option<&DynamicObject>) -> Condition {
    let Some(rule) = rule else {
        return default_health(resource);
    };
    if rule.always_healthy.is_some() {
        return healthy(ConditionStatus::True, ALWAYS_HEALTHY);
    }
    let Some(stamped) = stamped else {
        return healthy(ConditionStatus::Unknown, UNKNOWN);
    };
    if let Some(type_) = &rule.single_condition_type {
        return single_condition(type_, stamped);
    }
    match &rule.multi_match {
        Some(multi) => {
            let root = stamped
                .to_value()
                .into_option_logged("stamped object rendering")
                .unwrap_or_default();
            any_unhealthy(&multi.unhealthy, stamped, &root)
                .or_else(|| all_healthy(&multi.healthy, stamped, &root))
                .unwrap_or_else(|| healthy(ConditionStatus::Unknown, NO_MATCHES_FULFILLED))
        }
        None => healthy(ConditionStatus::Unknown, UNKNOWN),
    }
}

fn default_health(resource: &RealizedResource) -> Condition {
    if !resource.outputs.is_empty() {
        return healthy(ConditionStatus::True, OUTPUTS_AVAILABLE);
    }
    let plain = resource
        .template_ref
        .as_ref()
        .is_some_and(|t| t.kind == TemplateKind::Plain.as_str());
    match (plain, resource.stamped_ref.is_some()) {
        (true, true) => healthy(ConditionStatus::True, ALWAYS_HEALTHY),
        (true, false) => healthy(ConditionStatus::Unknown, NO_STAMPED_OBJECT),
        (false, _) => healthy(ConditionStatus::Unknown, OUTPUT_NOT_AVAILABLE),
    }
}

fn single_condition(type_: &str, stamped: &DynamicObject) -> Condition {
    let reason = format!("{type_}Condition");
    match observed_condition(stamped, type_) {
        Some(found) => healthy(found.status, reason).with_message(found.message),
        None => healthy(ConditionStatus::Unknown, reason)
            .with_message(format!("condition with type [{type_}] not found on resource status")),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field_message(requirement: &HealthMatchFieldRequirement, root: &Value) -> String {
    let value = evaluate(&requirement.requirement.key, root)
        .map_or_else(|_| "<error retrieving field value>".to_string(), |v| render(&v));
    let path = requirement.message_path.as_deref().unwrap_or_default();
    let message = evaluate(path, root).map_or_else(
        |_| format!("unknown, error retrieving message path [{path}]"),
        |v| render(&v),
    );
    format!("field value: {value}, message: {message}")
}

fn condition_message(status: ConditionStatus, message: &str) -> String {
    format!("condition status: {status}, message: {message}")
}

/// `False` as soon as any requirement of `rule` holds.
fn any_unhealthy(rule: &HealthMatchRule, stamped: &DynamicObject, root: &Value) -> Option<Condition> {
    for requirement in &rule.match_conditions {
        if let Some(found) = observed_condition(stamped, &requirement.type_).filter(|c| c.status == requirement.status) {
            return Some(
                healthy(ConditionStatus::False, MATCHED_CONDITION)
                    .with_message(condition_message(found.status, &found.message)),
            );
        }
    }
    rule.match_fields
        .iter()
        .find(|field| field_requirement_matches(&field.requirement, root).unwrap_or(false))
        .map(|field| healthy(ConditionStatus::False, MATCHED_FIELD).with_message(field_message(field, root)))
}

/// `True` when every requirement of `rule` holds. The first requirement
/// supplies the reason and message.
fn all_healthy(rule: &HealthMatchRule, stamped: &DynamicObject, root: &Value) -> Option<Condition> {
    let mut first: Option<(&str, String)> = None;
    for requirement in &rule.match_conditions {
        let found = observed_condition(stamped, &requirement.type_).filter(|c| c.status == requirement.status)?;
        first.get_or_insert_with(|| (MATCHED_CONDITION, condition_message(found.status, &found.message)));
    }
    for field in &rule.match_fields {
        if !field_requirement_matches(&field.requirement, root).unwrap_or(false) {
            return None;
        }
        first.get_or_insert_with(|| (MATCHED_FIELD, field_message(field, root)));
    }
    first.map(|(reason, message)| healthy(ConditionStatus::True, reason).with_message(message))
}

/// Fold the `Healthy` condition of every step into `ResourcesHealthy`.
#[must_use]
pub fn owner_health(resources: &[RealizedResource]) -> Condition {
    let mut manager = ConditionManager::new(RESOURCES_HEALTHY, &[]);
    for condition in resources.iter().filter_map(|r| conditions::find(&r.conditions, HEALTHY)) {
        manager.add_positive(condition.clone());
    }
    let (folded, _) = manager.finalize();
    let top = conditions::find(&folded, RESOURCES_HEALTHY)
        .cloned()
        .unwrap_or_else(|| Condition::new(RESOURCES_HEALTHY, ConditionStatus::Unknown, UNKNOWN));
    Condition {
        reason: HEALTHY_CONDITION_RULE.to_string(),
        ..top
    }
}
