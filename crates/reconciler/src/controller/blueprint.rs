//! The pipeline reconciler: a pipeline is ready once every template it
//! references exists.

use std::marker::PhantomData;

use async_trait::async_trait;
use choreo_core::api::Blueprint;
use choreo_core::conditions::{Condition, ConditionManager, ConditionStatus};
use choreo_core::ObjectKey;
use tracing::{debug, info};

use super::{Context, Pipeline, READY};
use crate::error::Result;
use crate::r#loop::{Action, Reconcile};
use crate::repository::RepositoryError;

pub const TEMPLATES_READY: &str = "TemplatesReady";
pub const TEMPLATES_NOT_FOUND: &str = "TemplatesNotFound";

/// Reconciles `ClusterSupplyChain` or `ClusterDelivery` objects.
pub struct BlueprintReconciler<P> {
    ctx: Context,
    blueprint: PhantomData<fn() -> P>,
}

impl<P> BlueprintReconciler<P>
where
    P: Blueprint + Pipeline + PartialEq,
{
    #[must_use]
    pub const fn new(ctx: Context) -> Self {
        Self {
            ctx,
            blueprint: PhantomData,
        }
    }

    /// Steps whose template, or one of whose template options, is missing.
    async fn missing_templates(&self, blueprint: &P) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for resource in &blueprint.blueprint_spec().resources {
            let reference = &resource.template_ref;
            let mut found = reference.candidate_names().next().is_some();
            for name in reference.candidate_names() {
                match self.ctx.repo.get_template(&reference.kind, name).await {
                    Ok(Some(_)) => {}
                    Ok(None) | Err(RepositoryError::UnknownTemplateKind { .. }) => found = false,
                    Err(e) => return Err(e.into()),
                }
            }
            if !found {
                missing.push(resource.name.clone());
            }
        }
        Ok(missing)
    }
}

#[async_trait]
impl<P> Reconcile for BlueprintReconciler<P>
where
    P: Blueprint + Pipeline + PartialEq,
{
    fn name(&self) -> &'static str {
        P::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut blueprint) = self.ctx.repo.get::<P>(key).await? else {
            debug!("Pipeline no longer exists");
            return Ok(Action::Done);
        };
        let before = blueprint.clone();
        let generation = blueprint.metadata().generation;
        let mut conditions =
            ConditionManager::new(READY, &blueprint.blueprint_status().conditions).with_generation(generation);

        let missing = self.missing_templates(&blueprint).await?;
        if missing.is_empty() {
            conditions.add_positive(Condition::new(TEMPLATES_READY, ConditionStatus::True, READY));
        } else {
            info!(missing = ?missing, "Pipeline references missing templates");
            conditions.add_positive(
                Condition::new(TEMPLATES_READY, ConditionStatus::False, TEMPLATES_NOT_FOUND)
                    .with_message(format!("did not find templates for resources [{}]", missing.join(", "))),
            );
        }

        let (finalized, _) = conditions.finalize();
        let status = blueprint.blueprint_status_mut();
        status.conditions = finalized;
        status.observed_generation = generation;

        if blueprint != before {
            self.ctx.repo.status_update(&blueprint).await?;
            info!(generation, "Status updated");
        }

        Ok(Action::RequeueAfter(self.ctx.config.requeue_interval()))
    }
}
