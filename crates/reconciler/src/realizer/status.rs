//! Per-resource status entries.

use chrono::{DateTime, Utc};
use choreo_core::api::{ObjectReference, RealizedResource, ResourceInput};
use choreo_core::api::HealthRule;
use choreo_core::conditions;
use choreo_core::{Condition, ConditionManager, ConditionStatus, DynamicObject};

use super::health::{self, HEALTHY};
use super::outputs::{self, Outputs};
use super::{RealizeError, Step};

pub const RESOURCE_SUBMITTED: &str = "ResourceSubmitted";
pub const READY: &str = "Ready";
pub const RESOURCE_SUBMISSION_COMPLETE: &str = "ResourceSubmissionComplete";

/// Everything one step produced, successful or not.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub template: Option<ObjectReference>,
    pub stamped: Option<DynamicObject>,
    pub outputs: Option<Outputs>,
    pub error: Option<RealizeError>,
    pub health_rule: Option<HealthRule>,
}

/// The `ResourceSubmitted` condition for an outcome.
#[must_use]
pub fn submitted_condition(error: Option<&RealizeError>) -> Condition {
    match error {
        None => Condition::new(RESOURCE_SUBMITTED, ConditionStatus::True, RESOURCE_SUBMISSION_COMPLETE),
        Some(e) if e.is_waiting() => {
            Condition::new(RESOURCE_SUBMITTED, ConditionStatus::Unknown, e.reason()).with_message(e.to_string())
        }
        Some(e) => Condition::new(RESOURCE_SUBMITTED, ConditionStatus::False, e.reason()).with_message(e.to_string()),
    }
}

/// Build the status entry of a step. A step that never got as far as
/// submitting keeps its previous entry and its previous health, with a
/// refreshed `ResourceSubmitted`.
#[must_use]
pub fn realized_resource(
    step: &Step,
    outcome: &StepOutcome,
    previous: Option<&RealizedResource>,
    now: DateTime<Utc>,
) -> RealizedResource {
    let mut resource = match (&outcome.stamped, previous) {
        (Some(stamped), _) => stamped_resource(step, outcome, stamped, previous, now),
        (None, Some(previous)) => previous.clone(),
        (None, None) => RealizedResource {
            name: step.name.clone(),
            template_ref: outcome.template.clone(),
            ..RealizedResource::default()
        },
    };

    let healthy = match (&outcome.stamped, previous) {
        (None, Some(previous)) => conditions::find(&previous.conditions, HEALTHY).cloned(),
        _ => Some(health::determine(outcome.health_rule.as_ref(), &resource, outcome.stamped.as_ref())),
    };

    let previous_conditions = previous.map(|p| p.conditions.as_slice()).unwrap_or_default();
    let mut manager = ConditionManager::new(READY, previous_conditions);
    manager.add_positive(submitted_condition(outcome.error.as_ref()));
    if let Some(healthy) = healthy {
        manager.add_positive(healthy);
    }
    (resource.conditions, _) = manager.finalize();
    resource
}

fn stamped_resource(
    step: &Step,
    outcome: &StepOutcome,
    stamped: &DynamicObject,
    previous: Option<&RealizedResource>,
    now: DateTime<Utc>,
) -> RealizedResource {
    let previous_outputs = previous.map(|p| p.outputs.as_slice()).unwrap_or_default();
    let outputs = outcome.outputs.as_ref().map_or_else(
        || previous_outputs.to_vec(),
        |values| outputs::to_status(values, previous_outputs, now),
    );

    RealizedResource {
        name: step.name.clone(),
        template_ref: outcome.template.clone(),
        stamped_ref: Some(ObjectReference::from(stamped)),
        inputs: step
            .inputs
            .iter()
            .map(|input| ResourceInput {
                name: input
                    .source()
                    .map_or_else(|| input.from.clone(), |(from, _)| from.to_string()),
            })
            .collect(),
        outputs,
        conditions: Vec::new(),
    }
}
