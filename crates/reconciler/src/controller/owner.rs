//! The intent reconciler.

use std::marker::PhantomData;

use async_trait::async_trait;
use choreo_core::api::{Lifecycle, ObjectReference, RealizedResource, Secret, ServiceAccount};
use choreo_core::conditions::{Condition, ConditionManager, ConditionStatus};
use choreo_core::{labels, DynamicObject, ObjectKey, Resource, ResultExt, TypeMeta};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{
    Context, Intent, Pipeline, MISSING_LABELS, PIPELINE_NOT_FOUND, READY, SELECTOR_ERROR,
    SERVICE_ACCOUNT_SECRET_ERROR, TOO_MANY_MATCHES,
};
use crate::error::{Error, Result};
use crate::r#loop::{Action, Reconcile};
use crate::realizer::health::owner_health;
use crate::realizer::{resolve_selector, RealizeError, RealizeRequest, Realizer};
use crate::repository::{Repository, RepositoryError};
use crate::selector::Selectable;
use crate::substrate::Credentials;
use crate::tracker::Reference;

/// Reconciles one intent kind against its pipelines.
pub struct OwnerReconciler<I> {
    ctx: Context,
    intent: PhantomData<fn() -> I>,
}

impl<I: Intent> OwnerReconciler<I> {
    #[must_use]
    pub const fn new(ctx: Context) -> Self {
        Self {
            ctx,
            intent: PhantomData,
        }
    }

    fn requeue(&self) -> Action {
        Action::RequeueAfter(self.ctx.config.requeue_interval())
    }

    /// Select the pipeline. `Ok(None)` means no single pipeline matched and
    /// the reason is already recorded.
    async fn bind(&self, intent: &I, conditions: &mut ConditionManager) -> Result<Option<I::Pipeline>> {
        let vocabulary = I::VOCABULARY;

        if let Some(name) = intent.pipeline_name() {
            let pipeline = self.ctx.repo.get::<I::Pipeline>(&ObjectKey::cluster(name)).await?;
            if pipeline.is_none() {
                let error = RealizeError::GetTemplate {
                    step: name.to_string(),
                    kind: <I::Pipeline as Resource>::KIND.to_string(),
                    name: name.to_string(),
                    reason: "not found".to_string(),
                };
                conditions.add_positive(
                    Condition::new(
                        vocabulary.submitted,
                        ConditionStatus::False,
                        (vocabulary.realize_reason)(&error),
                    )
                    .with_message(error.to_string()),
                );
                return Err(error.into());
            }
            return Ok(pipeline);
        }

        let selection = vocabulary.pipeline_ready.unwrap_or(READY);
        let labels = &intent.metadata().labels;
        if labels.is_empty() {
            conditions.add_positive(
                Condition::new(selection, ConditionStatus::False, MISSING_LABELS)
                    .with_message(format!("{} is missing required labels", I::KIND)),
            );
            return Ok(None);
        }

        let fields = intent
            .to_dynamic()
            .and_then(|obj| obj.to_value())
            .map_err(|e| Error::reconcile_failed(e.to_string()))?;
        let matches = match self
            .ctx
            .repo
            .pipelines_for::<I::Pipeline>(&Selectable::new(labels, &fields))
            .await
        {
            Ok(matches) => matches,
            Err(e @ RepositoryError::Selector(_)) => {
                warn!(error = %e, "Pipeline selector cannot be evaluated");
                conditions.add_positive(
                    Condition::new(selection, ConditionStatus::False, SELECTOR_ERROR).with_message(e.to_string()),
                );
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        match <[I::Pipeline; 1]>::try_from(matches) {
            Ok([only]) => Ok(Some(only)),
            Err(found) => {
                let (reason, message) = if found.is_empty() {
                    (
                        PIPELINE_NOT_FOUND,
                        format!("no {} found where full selector is satisfied by labels: {labels:?}", <I::Pipeline as Resource>::KIND),
                    )
                } else {
                    let names: Vec<&str> = found.iter().map(|p| p.name()).collect();
                    (
                        TOO_MANY_MATCHES,
                        format!("more than one {} selected: {}", <I::Pipeline as Resource>::KIND, names.join(", ")),
                    )
                };
                info!(reason, "No single pipeline for intent");
                conditions.add_positive(Condition::new(selection, ConditionStatus::False, reason).with_message(message));
                Ok(None)
            }
        }
    }

    /// Build the repository that stamps as the intent's service account.
    /// `Ok(None)` means the failure was recorded and the reconcile ends.
    async fn stamping_repository(
        &self,
        intent: &I,
        pipeline: &I::Pipeline,
        owner: &Reference,
        conditions: &mut ConditionManager,
    ) -> Result<Option<Repository>> {
        let vocabulary = I::VOCABULARY;
        let namespace = intent.namespace().to_string();
        let (service_account, sa_namespace) = match (intent.service_account_name(), pipeline.service_account_ref()) {
            (Some(name), _) => (name.to_string(), namespace),
            (None, Some(reference)) => (
                reference.name.clone(),
                reference.namespace.clone().unwrap_or(namespace),
            ),
            (None, None) => (self.ctx.config.default_service_account.clone(), namespace),
        };

        self.ctx.tracker.track(
            Reference::new(
                ServiceAccount::type_meta(),
                ObjectKey::namespaced(&sa_namespace, &service_account),
            ),
            owner.clone(),
        );

        let secret = match self
            .ctx
            .repo
            .service_account_secret(&service_account, &sa_namespace)
            .await
        {
            Ok(secret) => secret,
            Err(e) => {
                warn!(service_account = %service_account, error = %e, "Service account secret unavailable");
                conditions.add_positive(
                    Condition::new(vocabulary.submitted, ConditionStatus::False, SERVICE_ACCOUNT_SECRET_ERROR)
                        .with_message(e.to_string()),
                );
                return Ok(None);
            }
        };
        self.ctx.tracker.track(Reference::of::<Secret>(&secret), owner.clone());

        let credentials = Credentials {
            service_account,
            namespace: sa_namespace,
            token: secret.service_account_token().unwrap_or_default().to_string(),
        };
        match self.ctx.client_builder.build(&credentials) {
            Ok(client) => Ok(Some(self.ctx.repo.with_substrate(client))),
            Err(e) => {
                conditions.add_positive(
                    Condition::new(vocabulary.submitted, ConditionStatus::False, vocabulary.client_builder_error)
                        .with_message(e.to_string()),
                );
                Err(e.into())
            }
        }
    }

    async fn drive(&self, intent: &mut I, owner: &Reference, conditions: &mut ConditionManager) -> Result<Action> {
        let vocabulary = I::VOCABULARY;

        let Some(pipeline) = self.bind(intent, conditions).await? else {
            intent.set_pipeline_ref(None);
            return Ok(if intent.metadata().labels.is_empty() {
                Action::Done
            } else {
                self.requeue()
            });
        };
        let pipeline_ref = ObjectReference {
            api_version: <I::Pipeline as Resource>::API_VERSION.to_string(),
            kind: <I::Pipeline as Resource>::KIND.to_string(),
            namespace: None,
            name: pipeline.name().to_string(),
        };
        intent.set_pipeline_ref(Some(pipeline_ref));

        if let Some(selection) = vocabulary.pipeline_ready {
            let readiness = pipeline
                .readiness()
                .unwrap_or_else(|| Condition::new(READY, ConditionStatus::True, READY));
            if readiness.status != ConditionStatus::True {
                debug!(pipeline = pipeline.name(), reason = %readiness.reason, "Pipeline not ready");
                conditions.add_positive(
                    Condition::new(selection, readiness.status, readiness.reason).with_message(readiness.message),
                );
                return Ok(self.requeue());
            }
            conditions.add_positive(Condition::new(selection, ConditionStatus::True, READY));
        }

        let Some(stamping) = self.stamping_repository(intent, &pipeline, owner, conditions).await? else {
            return Ok(self.requeue());
        };

        let mut extra_context = Map::new();
        if let Some(selector) = intent.resource_selector() {
            match resolve_selector(&stamping, selector, intent.namespace()).await {
                Ok(selected) => {
                    extra_context.insert(
                        "selected".to_string(),
                        selected.to_value().into_option_logged("selected object").unwrap_or_default(),
                    );
                }
                Err(e) => {
                    conditions.add_positive(
                        Condition::new(vocabulary.submitted, ConditionStatus::False, (vocabulary.realize_reason)(&e))
                            .with_message(e.to_string()),
                    );
                    return Ok(self.requeue());
                }
            }
        }
        if let Some(inputs) = intent.context_inputs() {
            extra_context.insert("inputs".to_string(), Value::Object(inputs.clone()));
        }

        let owner_obj = intent
            .to_dynamic()
            .map_err(|e| Error::reconcile_failed(e.to_string()))?;
        let steps = pipeline.steps();
        let previous = intent.owner_status().resources.clone();
        let request = RealizeRequest {
            owner: &owner_obj,
            owner_ref: intent.controller_reference(),
            context_key: I::CONTEXT_KEY,
            extra_context,
            base_labels: intent.provenance(pipeline.name()),
            steps: &steps,
            pipeline_params: pipeline.params(),
            owner_params: intent.params(),
            previous: &previous,
            retention: intent.retention(),
        };
        let realization = Realizer::new(self.ctx.repo.clone(), stamping).realize(&request).await;

        for template in &realization.templates {
            self.ctx.tracker.track(
                Reference::new(
                    TypeMeta::new(&template.api_version, &template.kind),
                    ObjectKey::cluster(&template.name),
                ),
                owner.clone(),
            );
        }
        for stamped in &realization.stamped {
            self.ctx.stamped.watch(&stamped.type_meta());
        }

        self.delete_orphans(&previous, &realization.resources).await;
        intent.owner_status_mut().resources = realization.resources.clone();
        intent.record_outputs(&realization.outputs);

        let condition = match realization.first_error() {
            None => Condition::new(vocabulary.submitted, ConditionStatus::True, vocabulary.submitted_complete),
            Some(e) => {
                let status = if e.is_waiting() {
                    ConditionStatus::Unknown
                } else {
                    ConditionStatus::False
                };
                Condition::new(vocabulary.submitted, status, (vocabulary.realize_reason)(e)).with_message(e.to_string())
            }
        };
        conditions.add_positive(condition);
        if vocabulary.resources_healthy {
            conditions.add_positive(owner_health(&realization.resources));
        }
        if let Some(stamped_condition) = vocabulary.stamped_condition {
            conditions.add_positive(stamped_condition(realization.stamped.last()));
        }

        match realization.first_unhandled() {
            Some(e) => Err(e.clone().into()),
            None => Ok(self.requeue()),
        }
    }

    /// Delete objects stamped by an earlier reconcile that no step stamps any
    /// more. Failures are logged and never fail the reconcile.
    async fn delete_orphans(&self, previous: &[RealizedResource], realized: &[RealizedResource]) {
        for entry in previous {
            let Some(stamped_ref) = &entry.stamped_ref else {
                continue;
            };
            let key = stamped_ref
                .namespace
                .as_ref()
                .map_or_else(|| ObjectKey::cluster(&stamped_ref.name), |ns| ObjectKey::namespaced(ns, &stamped_ref.name));
            let type_meta = TypeMeta::new(&stamped_ref.api_version, &stamped_ref.kind);
            let object = match self.ctx.repo.get_unstructured(&type_meta, &key).await {
                Ok(Some(object)) => object,
                Ok(None) => continue,
                Err(e) => {
                    warn!(kind = %type_meta, key = %key, error = %e, "Cannot read previously stamped object");
                    continue;
                }
            };
            if realized.iter().any(|current| still_stamped(entry, &object, current)) {
                continue;
            }
            match self.ctx.repo.delete(&object).await {
                Ok(()) => info!(kind = %type_meta, key = %key, step = %entry.name, "Deleted orphaned object"),
                Err(e) => warn!(kind = %type_meta, key = %key, error = %e, "Cannot delete orphaned object"),
            }
        }
    }
}

/// Whether `current` accounts for the object `previous` stamped. Each input
/// set of an immutable step gets a new object, so any object of the same step
/// and template counts. Mutable objects must be the same object.
fn still_stamped(previous: &RealizedResource, object: &DynamicObject, current: &RealizedResource) -> bool {
    let Some(current_ref) = &current.stamped_ref else {
        return false;
    };
    let immutable = object.metadata.labels.get(labels::TEMPLATE_LIFECYCLE).map(String::as_str)
        == Some(Lifecycle::Immutable.as_str());
    if immutable {
        let same_template = match (&previous.template_ref, &current.template_ref) {
            (Some(a), Some(b)) => a.name == b.name && a.kind == b.kind,
            _ => false,
        };
        return same_template && previous.name == current.name;
    }
    previous.stamped_ref.as_ref() == Some(current_ref)
}

#[async_trait]
impl<I: Intent> Reconcile for OwnerReconciler<I> {
    fn name(&self) -> &'static str {
        I::VOCABULARY.controller
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let owner = Reference::new(I::type_meta(), key.clone());
        let Some(mut intent) = self.ctx.repo.get::<I>(key).await? else {
            debug!("Intent no longer exists");
            self.ctx.tracker.clear_tracked(&owner);
            return Ok(Action::Done);
        };
        let before = intent.clone();
        let generation = intent.metadata().generation;
        let mut conditions =
            ConditionManager::new(READY, &intent.owner_status().conditions).with_generation(generation);

        let outcome = self.drive(&mut intent, &owner, &mut conditions).await;

        let (finalized, _) = conditions.finalize();
        let status = intent.owner_status_mut();
        status.conditions = finalized;
        status.observed_generation = generation;

        if intent != before {
            self.ctx.repo.status_update(&intent).await.map_err(|e| {
                warn!(error = %e, "Status update failed");
                Error::from(e)
            })?;
            info!(generation, "Status updated");
        }

        outcome
    }
}
