//! Controllers for intents and pipelines.
//!
//! One generic [`OwnerReconciler`] serves every intent kind; the kinds differ
//! only in their pipeline kind, provenance labels and condition vocabulary,
//! which [`Intent`] and [`Pipeline`] describe. [`BlueprintReconciler`]
//! validates the template references of supply chains and deliveries.

mod blueprint;
mod owner;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use choreo_core::api::{
    Blueprint, BlueprintParam, ClusterDelivery, ClusterRunTemplate, ClusterSupplyChain,
    Deliverable, ObjectReference, Owner, ResourceSelector, RetentionPolicy, Runnable, Selector,
    ServiceAccountRef, Workload,
};
use choreo_core::conditions::{self, Condition, ConditionStatus};
use choreo_core::{labels, DynamicObject, Resource};
use serde_json::{Map, Value};

use crate::config::ReconcilerConfig;
use crate::realizer::{observed_condition, Outputs, RealizeError, ResolvedTemplate, Step, StepTemplate, SUCCEEDED};
use crate::repository::Repository;
use crate::selector::Candidate;
use crate::substrate::ClientBuilder;
use crate::tracker::{DependencyTracker, StampedTracker};

pub use blueprint::{BlueprintReconciler, TEMPLATES_READY, TEMPLATES_NOT_FOUND};
pub use owner::OwnerReconciler;

/// Top-level condition of every intent and pipeline.
pub const READY: &str = "Ready";
pub const MISSING_LABELS: &str = "MissingLabels";
pub const PIPELINE_NOT_FOUND: &str = "PipelineNotFound";
pub const TOO_MANY_MATCHES: &str = "TooManyMatches";
pub const NOT_RECONCILED: &str = "PipelineNotReconciled";
pub const SERVICE_ACCOUNT_SECRET_ERROR: &str = "ServiceAccountSecretError";
pub const SELECTOR_ERROR: &str = "SelectorError";
pub const STAMPED_OBJECT_CONDITION: &str = "StampedObjectCondition";
pub const SUCCEEDED_CONDITION: &str = "SucceededCondition";

/// Everything a controller shares with the others.
#[derive(Clone)]
pub struct Context {
    /// Client acting as the engine itself.
    pub repo: Repository,
    /// Builds clients acting as an intent's service account.
    pub client_builder: Arc<dyn ClientBuilder>,
    pub tracker: Arc<DependencyTracker>,
    pub stamped: Arc<StampedTracker>,
    pub config: ReconcilerConfig,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("tracker", &self.tracker)
            .field("stamped", &self.stamped)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Condition names and reasons an intent kind reports.
#[derive(Debug, Clone, Copy)]
pub struct Vocabulary {
    /// Controller name in logs.
    pub controller: &'static str,
    /// Condition reporting pipeline selection. `None` for intents that name
    /// their pipeline directly.
    pub pipeline_ready: Option<&'static str>,
    /// Condition reporting the outcome of realization.
    pub submitted: &'static str,
    /// Reason of a successful realization.
    pub submitted_complete: &'static str,
    /// Reason for a service account client that cannot be built.
    pub client_builder_error: &'static str,
    /// Reason for a realizer failure.
    pub realize_reason: fn(&RealizeError) -> &'static str,
    /// Whether step health folds into `ResourcesHealthy`.
    pub resources_healthy: bool,
    /// Condition mirrored from the newest stamped object, if the kind has one.
    pub stamped_condition: Option<fn(Option<&DynamicObject>) -> Condition>,
}

const SUPPLY_CHAIN_VOCABULARY: Vocabulary = Vocabulary {
    controller: "workload",
    pipeline_ready: Some("SupplyChainReady"),
    submitted: "ResourcesSubmitted",
    submitted_complete: "ResourceSubmissionComplete",
    client_builder_error: "ResourceRealizerBuilderError",
    realize_reason: RealizeError::reason,
    resources_healthy: true,
    stamped_condition: None,
};

const DELIVERY_VOCABULARY: Vocabulary = Vocabulary {
    controller: "deliverable",
    pipeline_ready: Some("DeliveryReady"),
    ..SUPPLY_CHAIN_VOCABULARY
};

const RUNNABLE_VOCABULARY: Vocabulary = Vocabulary {
    controller: "runnable",
    pipeline_ready: None,
    submitted: "RunTemplateReady",
    submitted_complete: READY,
    client_builder_error: "ClientBuilderError",
    realize_reason: run_template_reason,
    resources_healthy: false,
    stamped_condition: Some(run_succeeded),
};

fn run_template_reason(error: &RealizeError) -> &'static str {
    match error {
        RealizeError::GetTemplate { .. } => "RunTemplateNotFound",
        RealizeError::ApplyStampedObject { .. } => "StampedObjectRejectedByAPIServer",
        RealizeError::MissingInput { .. } | RealizeError::RetrieveOutput { .. } => "OutputPathNotSatisfied",
        other => other.reason(),
    }
}

/// `StampedObjectCondition` of a runnable: the run's `Succeeded` condition,
/// or `Unknown` while the run has not reported one.
fn run_succeeded(stamped: Option<&DynamicObject>) -> Condition {
    match stamped.and_then(|obj| observed_condition(obj, SUCCEEDED)) {
        Some(succeeded) => Condition::new(STAMPED_OBJECT_CONDITION, succeeded.status, SUCCEEDED_CONDITION)
            .with_message(succeeded.message),
        None => Condition::new(STAMPED_OBJECT_CONDITION, ConditionStatus::Unknown, "Unknown"),
    }
}

/// A pipeline an intent binds to.
pub trait Pipeline: Resource + Candidate + fmt::Debug {
    /// The steps to realize, in order.
    fn steps(&self) -> Vec<Step>;

    /// Pipeline-level parameter defaults.
    fn params(&self) -> &[BlueprintParam];

    /// Service account used when the intent names none.
    fn service_account_ref(&self) -> Option<&ServiceAccountRef>;

    /// The pipeline's own `Ready` condition, or `None` if it has no
    /// readiness of its own.
    fn readiness(&self) -> Option<Condition>;
}

macro_rules! blueprint_pipeline {
    ($ty:ty) => {
        impl Candidate for $ty {
            fn candidate_name(&self) -> &str {
                &self.metadata.name
            }

            fn selector(&self) -> &Selector {
                &self.spec.selector
            }
        }

        impl Pipeline for $ty {
            fn steps(&self) -> Vec<Step> {
                self.spec.resources.iter().map(Step::from).collect()
            }

            fn params(&self) -> &[BlueprintParam] {
                &self.spec.params
            }

            fn service_account_ref(&self) -> Option<&ServiceAccountRef> {
                self.spec.service_account_ref.as_ref()
            }

            fn readiness(&self) -> Option<Condition> {
                Some(blueprint_readiness(self))
            }
        }
    };
}

blueprint_pipeline!(ClusterSupplyChain);
blueprint_pipeline!(ClusterDelivery);

fn blueprint_readiness<B: Blueprint>(blueprint: &B) -> Condition {
    let status = blueprint.blueprint_status();
    match conditions::find(&status.conditions, READY) {
        Some(ready) if status.observed_generation == blueprint.metadata().generation => ready.clone(),
        _ => Condition::new(READY, ConditionStatus::Unknown, NOT_RECONCILED)
            .with_message(format!("{} '{}' has not been reconciled yet", B::KIND, blueprint.name())),
    }
}

static NO_SELECTOR: Selector = Selector {
    selector: BTreeMap::new(),
    selector_match_expressions: Vec::new(),
    selector_match_fields: Vec::new(),
};

impl Candidate for ClusterRunTemplate {
    fn candidate_name(&self) -> &str {
        &self.metadata.name
    }

    fn selector(&self) -> &Selector {
        &NO_SELECTOR
    }
}

impl Pipeline for ClusterRunTemplate {
    fn steps(&self) -> Vec<Step> {
        vec![Step {
            name: self.metadata.name.clone(),
            template: StepTemplate::Inline(Box::new(ResolvedTemplate::from(self))),
            inputs: Vec::new(),
            params: Vec::new(),
        }]
    }

    fn params(&self) -> &[BlueprintParam] {
        &[]
    }

    fn service_account_ref(&self) -> Option<&ServiceAccountRef> {
        None
    }

    fn readiness(&self) -> Option<Condition> {
        None
    }
}

/// An intent kind the engine realizes.
pub trait Intent: Owner + PartialEq + fmt::Debug {
    /// Kind of pipeline realized for this intent.
    type Pipeline: Pipeline;

    /// Name of the intent in the template context.
    const CONTEXT_KEY: &'static str;

    /// Conditions this kind reports.
    const VOCABULARY: Vocabulary;

    /// Labels on every object stamped for this intent through `pipeline`.
    fn provenance(&self, pipeline: &str) -> BTreeMap<String, String>;

    /// The pipeline this intent names, for kinds that are not selected.
    fn pipeline_name(&self) -> Option<&str> {
        None
    }

    /// The pipeline recorded in status by the last reconcile.
    fn pipeline_ref(&self) -> Option<&ObjectReference> {
        None
    }

    /// Record the bound pipeline in status.
    fn set_pipeline_ref(&mut self, _reference: Option<ObjectReference>) {}

    /// Selector for an object exposed to templates as `selected`.
    fn resource_selector(&self) -> Option<&ResourceSelector> {
        None
    }

    /// Values exposed to templates as `inputs`, replacing step inputs.
    fn context_inputs(&self) -> Option<&Map<String, Value>> {
        None
    }

    /// Garbage collection of finished immutable children.
    fn retention(&self) -> Option<RetentionPolicy> {
        None
    }

    /// Record step outputs in status.
    fn record_outputs(&mut self, _outputs: &BTreeMap<String, Outputs>) {}
}

fn provenance_labels(
    name_label: &str,
    namespace_label: &str,
    pipeline_label: &str,
    intent: &impl Resource,
    pipeline: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (name_label.to_string(), intent.name().to_string()),
        (namespace_label.to_string(), intent.namespace().to_string()),
        (pipeline_label.to_string(), pipeline.to_string()),
    ])
}

impl Intent for Workload {
    type Pipeline = ClusterSupplyChain;
    const CONTEXT_KEY: &'static str = "workload";
    const VOCABULARY: Vocabulary = SUPPLY_CHAIN_VOCABULARY;

    fn provenance(&self, pipeline: &str) -> BTreeMap<String, String> {
        provenance_labels(
            labels::WORKLOAD_NAME,
            labels::WORKLOAD_NAMESPACE,
            labels::SUPPLY_CHAIN_NAME,
            self,
            pipeline,
        )
    }

    fn pipeline_ref(&self) -> Option<&ObjectReference> {
        self.status.supply_chain_ref.as_ref()
    }

    fn set_pipeline_ref(&mut self, reference: Option<ObjectReference>) {
        self.status.supply_chain_ref = reference;
    }
}

impl Intent for Deliverable {
    type Pipeline = ClusterDelivery;
    const CONTEXT_KEY: &'static str = "deliverable";
    const VOCABULARY: Vocabulary = DELIVERY_VOCABULARY;

    fn provenance(&self, pipeline: &str) -> BTreeMap<String, String> {
        provenance_labels(
            labels::DELIVERABLE_NAME,
            labels::DELIVERABLE_NAMESPACE,
            labels::DELIVERY_NAME,
            self,
            pipeline,
        )
    }

    fn pipeline_ref(&self) -> Option<&ObjectReference> {
        self.status.delivery_ref.as_ref()
    }

    fn set_pipeline_ref(&mut self, reference: Option<ObjectReference>) {
        self.status.delivery_ref = reference;
    }
}

impl Intent for Runnable {
    type Pipeline = ClusterRunTemplate;
    const CONTEXT_KEY: &'static str = "runnable";
    const VOCABULARY: Vocabulary = RUNNABLE_VOCABULARY;

    fn provenance(&self, pipeline: &str) -> BTreeMap<String, String> {
        provenance_labels(
            labels::RUNNABLE_NAME,
            labels::RUNNABLE_NAMESPACE,
            labels::RUN_TEMPLATE_NAME,
            self,
            pipeline,
        )
    }

    fn pipeline_name(&self) -> Option<&str> {
        Some(&self.spec.run_template_ref.name)
    }

    fn resource_selector(&self) -> Option<&ResourceSelector> {
        self.spec.selector.as_ref()
    }

    fn context_inputs(&self) -> Option<&Map<String, Value>> {
        Some(&self.spec.inputs)
    }

    fn retention(&self) -> Option<RetentionPolicy> {
        Some(self.spec.retention_policy)
    }

    fn record_outputs(&mut self, outputs: &BTreeMap<String, Outputs>) {
        // Keep the last known outputs until a newer run succeeds.
        if let Some(latest) = outputs.values().next().filter(|o| !o.is_empty()) {
            self.status.outputs = latest.clone();
        }
    }
}
