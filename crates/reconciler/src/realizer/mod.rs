//! Step realization.
//!
//! Walks the steps of one pipeline for one owner in declaration order. Each
//! step resolves its template, reads its inputs from the outputs of earlier
//! steps, stamps, submits through the repository, lists what it created and
//! reads its declared outputs back. A failing step does not stop the walk:
//! later steps still run so the status reports every problem, and steps that
//! depend on a failed one wait for its outputs.

mod error;
mod gc;
pub mod health;
mod outputs;
mod status;

use std::collections::BTreeMap;

use chrono::Utc;
use choreo_core::api::{
    BlueprintParam, ClusterRunTemplate, HealthRule, Lifecycle, ObjectReference, OwnerParam, PipelineResource,
    RealizedResource, ResourceSelector, RetentionPolicy, StepInput, Template, TemplateParam,
    TemplateReference, GROUP_VERSION,
};
use choreo_core::{labels, DynamicObject, OwnerReference, ResultExt, TypeMeta};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::repository::Repository;
use crate::selector::field_requirement_matches;
use crate::stamp::{apply_provenance, StampError, Stamper};

pub use error::RealizeError;
pub use outputs::{digest, observed_condition, preview, read_outputs, ObservedCondition, Outputs, SUCCEEDED};
pub use status::{StepOutcome, READY, RESOURCE_SUBMISSION_COMPLETE, RESOURCE_SUBMITTED};

/// Which child a step reads its outputs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    /// The submitted object, or for immutable steps the newest child whose
    /// outputs all resolve.
    Latest,
    /// The newest child whose `Succeeded` condition is `True`. No such child
    /// means no outputs yet, which is not an error.
    LatestSucceeded,
}

/// A template ready to stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTemplate {
    pub kind: String,
    pub name: String,
    pub body: Option<Value>,
    pub params: Vec<TemplateParam>,
    pub output_paths: BTreeMap<String, String>,
    pub lifecycle: Lifecycle,
    pub output_source: OutputSource,
    pub health_rule: Option<HealthRule>,
}

impl ResolvedTemplate {
    /// Reference to the template object.
    #[must_use]
    pub fn reference(&self) -> ObjectReference {
        template_reference(&self.kind, &self.name)
    }
}

impl From<&Template> for ResolvedTemplate {
    fn from(template: &Template) -> Self {
        Self {
            kind: template.kind.as_str().to_string(),
            name: template.name().to_string(),
            body: template.spec.template.clone(),
            params: template.spec.params.clone(),
            output_paths: template.spec.output_paths(),
            lifecycle: template.spec.lifecycle,
            output_source: OutputSource::Latest,
            health_rule: template.spec.health_rule.clone(),
        }
    }
}

impl From<&ClusterRunTemplate> for ResolvedTemplate {
    fn from(template: &ClusterRunTemplate) -> Self {
        Self {
            kind: "ClusterRunTemplate".to_string(),
            name: template.metadata.name.clone(),
            body: Some(template.spec.template.clone()),
            params: Vec::new(),
            output_paths: template.spec.outputs.clone(),
            lifecycle: Lifecycle::Immutable,
            output_source: OutputSource::LatestSucceeded,
            health_rule: None,
        }
    }
}

fn template_reference(kind: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: GROUP_VERSION.to_string(),
        kind: kind.to_string(),
        namespace: None,
        name: name.to_string(),
    }
}

/// Where a step's template comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum StepTemplate {
    /// Looked up on the substrate each reconcile.
    Reference(TemplateReference),
    /// Already in hand.
    Inline(Box<ResolvedTemplate>),
}

/// One unit of work in a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub template: StepTemplate,
    pub inputs: Vec<StepInput>,
    pub params: Vec<BlueprintParam>,
}

impl From<&PipelineResource> for Step {
    fn from(resource: &PipelineResource) -> Self {
        Self {
            name: resource.name.clone(),
            template: StepTemplate::Reference(resource.template_ref.clone()),
            inputs: resource.inputs.clone(),
            params: resource.params.clone(),
        }
    }
}

/// Everything the realizer needs to know about one owner and its pipeline.
#[derive(Debug, Clone)]
pub struct RealizeRequest<'a> {
    /// The owner as the substrate returned it.
    pub owner: &'a DynamicObject,
    /// Reference set as controller on every stamped object.
    pub owner_ref: OwnerReference,
    /// Name the owner is exposed under in the template context.
    pub context_key: &'static str,
    /// Additional top-level context entries.
    pub extra_context: Map<String, Value>,
    /// Provenance labels shared by all steps.
    pub base_labels: BTreeMap<String, String>,
    pub steps: &'a [Step],
    pub pipeline_params: &'a [BlueprintParam],
    pub owner_params: &'a [OwnerParam],
    /// Status entries from the previous reconcile.
    pub previous: &'a [RealizedResource],
    /// Garbage collection of immutable children, if any.
    pub retention: Option<RetentionPolicy>,
}

/// Result of walking a pipeline.
#[derive(Debug, Clone, Default)]
pub struct Realization {
    /// Status entry per step, in step order.
    pub resources: Vec<RealizedResource>,
    /// Failures in step order.
    pub errors: Vec<RealizeError>,
    /// Objects submitted this reconcile.
    pub stamped: Vec<DynamicObject>,
    /// Templates the steps referenced, found or not.
    pub templates: Vec<ObjectReference>,
    /// Outputs per step that produced them.
    pub outputs: BTreeMap<String, Outputs>,
}

impl Realization {
    /// The failure that determines the owner's condition.
    #[must_use]
    pub fn first_error(&self) -> Option<&RealizeError> {
        self.errors.first()
    }

    /// The first failure that must be retried.
    #[must_use]
    pub fn first_unhandled(&self) -> Option<&RealizeError> {
        self.errors.iter().find(|e| !e.is_handled())
    }
}

/// Walks pipelines. Templates are read with the controller's own client,
/// while stamped objects are written and listed with the owner's service
/// account.
#[derive(Clone)]
pub struct Realizer {
    templates: Repository,
    stamping: Repository,
}

impl Realizer {
    #[must_use]
    pub const fn new(templates: Repository, stamping: Repository) -> Self {
        Self { templates, stamping }
    }

    /// Realize every step of `request`.
    pub async fn realize(&self, request: &RealizeRequest<'_>) -> Realization {
        let owner_value = request.owner.to_value().into_option_logged("owner rendering").unwrap_or_default();
        let now = Utc::now();
        let mut realization = Realization::default();

        for step in request.steps {
            let mut outcome = StepOutcome::default();
            if let Err(e) = self
                .realize_step(request, &owner_value, step, &realization.outputs, &mut outcome)
                .await
            {
                if e.is_handled() {
                    info!(step = %step.name, error = %e, "Step not realized");
                } else {
                    warn!(step = %step.name, error = %e, "Step failed");
                }
                outcome.error = Some(e);
            }

            let previous = request.previous.iter().find(|r| r.name == step.name);
            realization
                .resources
                .push(status::realized_resource(step, &outcome, previous, now));

            realization.templates.extend(outcome.template);
            realization.stamped.extend(outcome.stamped);
            if let Some(outputs) = outcome.outputs {
                realization.outputs.insert(step.name.clone(), outputs);
            }
            realization.errors.extend(outcome.error);
        }

        realization
    }

    async fn realize_step(
        &self,
        request: &RealizeRequest<'_>,
        owner_value: &Value,
        step: &Step,
        prior: &BTreeMap<String, Outputs>,
        outcome: &mut StepOutcome,
    ) -> Result<(), RealizeError> {
        let template = self.resolve_template(owner_value, step, outcome).await?;
        outcome.health_rule.clone_from(&template.health_rule);
        let inputs = resolve_inputs(step, prior)?;
        let context = build_context(request, owner_value, step, &template, inputs);

        let stamp_error = |source: StampError| RealizeError::Stamp {
            step: step.name.clone(),
            template: template.name.clone(),
            source,
        };
        let body = template.body.as_ref().ok_or_else(|| {
            stamp_error(StampError::InvalidObject {
                reason: "template has no body".to_string(),
            })
        })?;
        let mut stamped = Stamper::new(&context).stamp(body).map_err(stamp_error)?;

        let namespace = request.owner.metadata.namespace.clone().unwrap_or_default();
        let step_labels = child_labels(request, step);
        let mut provenance = step_labels.clone();
        provenance.insert(labels::TEMPLATE_KIND.to_string(), template.kind.clone());
        provenance.insert(labels::TEMPLATE_NAME.to_string(), template.name.clone());
        if template.lifecycle == Lifecycle::Immutable {
            provenance.insert(
                labels::TEMPLATE_LIFECYCLE.to_string(),
                Lifecycle::Immutable.as_str().to_string(),
            );
        }
        apply_provenance(&mut stamped, request.owner_ref.clone(), &namespace, &provenance)
            .map_err(stamp_error)?;

        let type_meta = stamped.type_meta();
        let submitted_name = stamped.metadata.name_or_generate_name().to_string();
        let submitted = match template.lifecycle {
            Lifecycle::Mutable => self.stamping.ensure_mutable(&mut stamped).await,
            Lifecycle::Immutable => self.stamping.ensure_immutable(&mut stamped).await,
        };
        submitted.map_err(|source| RealizeError::ApplyStampedObject {
            step: step.name.clone(),
            kind: type_meta.kind.clone(),
            namespace: namespace.clone(),
            name: submitted_name,
            source,
        })?;
        debug!(step = %step.name, kind = %type_meta, key = %stamped.key(), "Stamped object submitted");
        outcome.stamped = Some(stamped.clone());

        let children = self
            .stamping
            .list_unstructured(&type_meta, Some(&namespace), &step_labels)
            .await
            .map_err(|source| RealizeError::ListCreatedObjects {
                step: step.name.clone(),
                kind: type_meta.kind.clone(),
                source,
            })?;

        if template.lifecycle == Lifecycle::Immutable {
            if let Some(policy) = request.retention {
                gc::collect(&self.stamping, &children, policy).await;
            }
        }

        outcome.outputs = select_outputs(step, &template, &stamped, &children)?;
        Ok(())
    }

    async fn resolve_template(
        &self,
        owner_value: &Value,
        step: &Step,
        outcome: &mut StepOutcome,
    ) -> Result<ResolvedTemplate, RealizeError> {
        let reference = match &step.template {
            StepTemplate::Inline(template) => {
                outcome.template = Some(template.reference());
                return Ok((**template).clone());
            }
            StepTemplate::Reference(reference) => reference,
        };

        let name = choose_template_name(owner_value, step, reference)?;
        outcome.template = Some(template_reference(&reference.kind, &name));

        let get_error = |reason: String| RealizeError::GetTemplate {
            step: step.name.clone(),
            kind: reference.kind.clone(),
            name: name.clone(),
            reason,
        };
        match self.templates.get_template(&reference.kind, &name).await {
            Ok(Some(template)) => Ok(ResolvedTemplate::from(&template)),
            Ok(None) => Err(get_error(format!("{} '{name}' not found", reference.kind))),
            Err(e) => Err(get_error(e.to_string())),
        }
    }
}

/// The template name a reference resolves to for this owner. Options are
/// evaluated against the owner and exactly one must match.
fn choose_template_name(
    owner_value: &Value,
    step: &Step,
    reference: &TemplateReference,
) -> Result<String, RealizeError> {
    if let Some(name) = &reference.name {
        return Ok(name.clone());
    }

    let mut matched = Vec::new();
    for option in &reference.options {
        let mut holds = true;
        for requirement in &option.selector.match_fields {
            holds &= field_requirement_matches(requirement, owner_value).map_err(|reason| {
                RealizeError::ResolveTemplateOption {
                    step: step.name.clone(),
                    option: option.name.clone(),
                    reason,
                }
            })?;
        }
        if holds {
            matched.push(option.name.clone());
        }
    }

    match matched.as_slice() {
        [only] => Ok(only.clone()),
        _ => Err(RealizeError::TemplateOptionsMatch {
            step: step.name.clone(),
            matched,
        }),
    }
}

/// Values for a step's inputs, by alias. `from` without an output name
/// yields the whole output map of that step.
fn resolve_inputs(step: &Step, prior: &BTreeMap<String, Outputs>) -> Result<Map<String, Value>, RealizeError> {
    step.inputs
        .iter()
        .map(|input| {
            let (from_step, output) = input.source().unwrap_or((input.from.as_str(), ""));
            let found = prior.get(from_step).and_then(|outputs| {
                if output.is_empty() {
                    Some(Value::Object(
                        outputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    ))
                } else {
                    outputs.get(output).cloned()
                }
            });
            found
                .map(|value| (input.name.clone(), value))
                .ok_or_else(|| RealizeError::MissingInput {
                    step: step.name.clone(),
                    input: input.name.clone(),
                    from_step: from_step.to_string(),
                    output: output.to_string(),
                })
        })
        .collect()
}

/// Parameters, low to high precedence: template defaults, pipeline,
/// step, owner.
fn merged_params(request: &RealizeRequest<'_>, step: &Step, template: &ResolvedTemplate) -> Map<String, Value> {
    let mut params = Map::new();
    for param in &template.params {
        params.insert(param.name.clone(), param.default.clone());
    }
    for param in request.pipeline_params.iter().chain(&step.params) {
        params.insert(param.name.clone(), param.default.clone());
    }
    for param in request.owner_params {
        params.insert(param.name.clone(), param.value.clone());
    }
    params
}

fn build_context(
    request: &RealizeRequest<'_>,
    owner_value: &Value,
    step: &Step,
    template: &ResolvedTemplate,
    inputs: Map<String, Value>,
) -> Value {
    let mut context = Map::new();
    context.insert(request.context_key.to_string(), owner_value.clone());
    context.insert(
        "params".to_string(),
        Value::Object(merged_params(request, step, template)),
    );
    context.insert("inputs".to_string(), Value::Object(inputs));
    context.extend(request.extra_context.clone());
    Value::Object(context)
}

/// Labels identifying the children of one step of one owner.
fn child_labels(request: &RealizeRequest<'_>, step: &Step) -> BTreeMap<String, String> {
    let mut selected = request.base_labels.clone();
    selected.insert(labels::RESOURCE_NAME.to_string(), step.name.clone());
    selected
}

fn retrieve_error(step: &Step, child: &DynamicObject, expression: String, reason: String) -> RealizeError {
    RealizeError::RetrieveOutput {
        step: step.name.clone(),
        expression,
        resource: format!("{}/{}", child.type_meta(), child.metadata.name),
        namespace: child.metadata.namespace.clone().unwrap_or_default(),
        reason,
    }
}

fn select_outputs(
    step: &Step,
    template: &ResolvedTemplate,
    stamped: &DynamicObject,
    children: &[DynamicObject],
) -> Result<Option<Outputs>, RealizeError> {
    if template.output_paths.is_empty() {
        return Ok(Some(Outputs::new()));
    }
    let paths = &template.output_paths;

    match (template.output_source, template.lifecycle) {
        (OutputSource::LatestSucceeded, _) => {
            let Some(child) = outputs::newest_first(children)
                .into_iter()
                .find(|c| outputs::succeeded(c) == Some(choreo_core::ConditionStatus::True))
            else {
                debug!(step = %step.name, "No succeeded child yet");
                return Ok(None);
            };
            read_outputs(child, paths)
                .map(Some)
                .map_err(|e| retrieve_error(step, child, e.expression, e.reason))
        }
        (OutputSource::Latest, Lifecycle::Immutable) => {
            let newest = outputs::newest_first(children);
            if let Some(found) = newest.iter().find_map(|c| read_outputs(c, paths).ok()) {
                return Ok(Some(found));
            }
            let child = newest.first().copied().unwrap_or(stamped);
            let unread = read_outputs(child, paths).err();
            let (expression, reason) = unread.map_or_else(
                || (String::new(), "no outputs".to_string()),
                |e| (e.expression, e.reason),
            );
            Err(retrieve_error(step, child, expression, reason))
        }
        (OutputSource::Latest, Lifecycle::Mutable) => {
            let child = children
                .iter()
                .find(|c| c.metadata.name == stamped.metadata.name)
                .unwrap_or(stamped);
            read_outputs(child, paths)
                .map(Some)
                .map_err(|e| retrieve_error(step, child, e.expression, e.reason))
        }
    }
}

/// Resolve a `Runnable` selector to exactly one object in `namespace`.
///
/// # Errors
///
/// Returns `RealizeError::SelectorNotMatched` unless exactly one object matches.
pub async fn resolve_selector(
    repo: &Repository,
    selector: &ResourceSelector,
    namespace: &str,
) -> Result<DynamicObject, RealizeError> {
    let type_meta = TypeMeta::new(&selector.resource.api_version, &selector.resource.kind);
    let not_matched = |reason: String| RealizeError::SelectorNotMatched {
        api_version: selector.resource.api_version.clone(),
        kind: selector.resource.kind.clone(),
        selector: format!("{:?}", selector.matching_labels),
        reason,
    };

    let found = repo
        .list_unstructured(&type_meta, Some(namespace), &selector.matching_labels)
        .await
        .map_err(|e| not_matched(e.to_string()))?;
    match <[DynamicObject; 1]>::try_from(found) {
        Ok([only]) => Ok(only),
        Err(found) if found.is_empty() => Err(not_matched("no matching object".to_string())),
        Err(found) => Err(not_matched(format!("{} matching objects", found.len()))),
    }
}
