//! Workload reconciliation against the in-memory substrate.
//!
//! Covers the happy path, a missing template, ambiguous pipeline selection,
//! a forbidden apply, outputs that are not yet available, and the submit
//! cache keeping steady ticks free of writes. Also covers health rules on
//! stamped objects and the deletion of objects no step stamps any more.

mod common;

use std::time::Duration;

use choreo_core::api::Workload;
use choreo_core::{labels, ConditionStatus, ObjectKey, TypeMeta};
use choreo_reconciler::substrate::{AccessRule, Verb};
use choreo_reconciler::{Action, Error, RealizeError};
use common::{
    condition, deploy_template, publish_artifacts, ready_supply_chain, supply_chain, workload,
    Fixture, ARTIFACT_URL, NAMESPACE,
};
use serde_json::json;

const CHAIN: &str = "source-to-url";

async fn happy_fixture() -> Fixture {
    let fixture = Fixture::new().await;
    publish_artifacts(&fixture).await;
    ready_supply_chain(&fixture, CHAIN, "web").await;
    fixture.seed(workload("app", "web")).await;
    fixture
}

// ==========================================================================
// Happy path
// ==========================================================================

#[tokio::test]
async fn test_happy_path_stamps_every_step() {
    let fixture = happy_fixture().await;

    let action = fixture.reconcile_workload("app").await;
    assert!(matches!(action, Ok(Action::RequeueAfter(d)) if d == Duration::from_secs(5)));

    let sources = fixture.all("source.toolkit.fluxcd.io/v1beta2", "GitRepository").await;
    assert_eq!(sources.len(), 1);
    let source = sources.first().unwrap();
    assert_eq!(source.metadata.name, "app-source");
    assert_eq!(source.metadata.labels.get(labels::WORKLOAD_NAME).map(String::as_str), Some("app"));
    assert_eq!(source.metadata.labels.get(labels::SUPPLY_CHAIN_NAME).map(String::as_str), Some(CHAIN));
    assert_eq!(source.metadata.labels.get(labels::RESOURCE_NAME).map(String::as_str), Some("build"));
    assert_eq!(source.metadata.controller().map(|o| o.kind.as_str()), Some("Workload"));

    let deployed = fixture.all("v1", "ConfigMap").await;
    assert_eq!(deployed.len(), 1);
    let config_map = deployed.first().unwrap();
    assert_eq!(config_map.metadata.labels.get(labels::RESOURCE_NAME).map(String::as_str), Some("deploy"));
    assert_eq!(config_map.data.get("data"), Some(&json!({"source": ARTIFACT_URL})));

    let app = fixture.workload("app").await;
    let status = &app.status.owner;
    assert_eq!(condition(&status.conditions, "Ready").status, ConditionStatus::True);
    assert_eq!(condition(&status.conditions, "SupplyChainReady").status, ConditionStatus::True);
    assert_eq!(
        condition(&status.conditions, "ResourcesSubmitted").reason,
        "ResourceSubmissionComplete"
    );
    assert_eq!(status.observed_generation, app.metadata.generation);
    assert_eq!(app.status.supply_chain_ref.as_ref().map(|r| r.name.as_str()), Some(CHAIN));

    let build = status.resources.iter().find(|r| r.name == "build").unwrap();
    assert_eq!(build.outputs.len(), 1);
    assert_eq!(build.outputs.first().map(|o| o.name.as_str()), Some("url"));
    assert!(build.outputs.first().unwrap().digest.starts_with("sha256:"));
    let deploy = status.resources.iter().find(|r| r.name == "deploy").unwrap();
    assert_eq!(deploy.inputs.first().map(|i| i.name.as_str()), Some("build"));
}

// ==========================================================================
// Missing template
// ==========================================================================

#[tokio::test]
async fn test_missing_template_is_unhandled() {
    let fixture = happy_fixture().await;
    fixture
        .delete(
            &TypeMeta::new("carto.run/v1alpha1", "ClusterTemplate"),
            &ObjectKey::cluster("deploy"),
        )
        .await;

    let result = fixture.reconcile_workload("app").await;
    assert!(matches!(result, Err(Error::Realize(RealizeError::GetTemplate { .. }))));

    assert_eq!(fixture.all("source.toolkit.fluxcd.io/v1beta2", "GitRepository").await.len(), 1);
    assert!(fixture.all("v1", "ConfigMap").await.is_empty());

    let app = fixture.workload("app").await;
    let ready = condition(&app.status.owner.conditions, "Ready");
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "TemplateObjectRetrievalFailure");
}

// ==========================================================================
// Ambiguous match
// ==========================================================================

#[tokio::test]
async fn test_two_matching_chains_stamp_nothing() {
    let fixture = happy_fixture().await;
    fixture.seed(supply_chain("second", "web")).await;
    fixture.reconcile_supply_chain("second").await.unwrap();

    let action = fixture.reconcile_workload("app").await;
    assert!(matches!(action, Ok(Action::RequeueAfter(_))));

    assert!(fixture.all("source.toolkit.fluxcd.io/v1beta2", "GitRepository").await.is_empty());
    let app = fixture.workload("app").await;
    let ready = condition(&app.status.owner.conditions, "Ready");
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "TooManyMatches");
    assert!(ready.message.contains("second"));
    assert!(app.status.supply_chain_ref.is_none());
}

#[tokio::test]
async fn test_no_matching_chain() {
    let fixture = happy_fixture().await;
    fixture.seed(workload("db", "postgres")).await;

    let action = fixture.reconcile_workload("db").await;
    assert!(matches!(action, Ok(Action::RequeueAfter(_))));

    let db = fixture.workload("db").await;
    let selected = condition(&db.status.owner.conditions, "SupplyChainReady");
    assert_eq!(selected.status, ConditionStatus::False);
    assert_eq!(selected.reason, "PipelineNotFound");
}

#[tokio::test]
async fn test_malformed_chain_selector_is_reported() {
    let fixture = Fixture::new().await;
    let mut chain = supply_chain(CHAIN, "web");
    chain["spec"]["selectorMatchExpressions"] = json!([{"key": "tier", "operator": "Near", "values": ["edge"]}]);
    fixture.seed(chain).await;
    fixture.seed(workload("app", "web")).await;

    let result = fixture.reconcile_workload("app").await;
    assert!(result.is_err());

    let app = fixture.workload("app").await;
    let selection = condition(&app.status.owner.conditions, "SupplyChainReady");
    assert_eq!((selection.status, selection.reason.as_str()), (ConditionStatus::False, "SelectorError"));
    assert!(selection.message.contains("Near"));
    assert_eq!(condition(&app.status.owner.conditions, "Ready").reason, "SelectorError");
}

#[tokio::test]
async fn test_unlabelled_workload_waits_for_labels() {
    let fixture = happy_fixture().await;
    fixture
        .seed(json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "Workload",
            "metadata": {"name": "bare", "namespace": NAMESPACE}
        }))
        .await;

    assert!(matches!(fixture.reconcile_workload("bare").await, Ok(Action::Done)));
    let bare = fixture.workload("bare").await;
    assert_eq!(condition(&bare.status.owner.conditions, "Ready").reason, "MissingLabels");
}

#[tokio::test]
async fn test_unreconciled_chain_is_not_ready() {
    let fixture = Fixture::new().await;
    fixture.seed(common::source_template()).await;
    fixture.seed(common::deploy_template()).await;
    fixture.seed(supply_chain(CHAIN, "web")).await;
    fixture.seed(workload("app", "web")).await;

    fixture.reconcile_workload("app").await.unwrap();

    let app = fixture.workload("app").await;
    let selected = condition(&app.status.owner.conditions, "SupplyChainReady");
    assert_eq!(selected.status, ConditionStatus::Unknown);
    assert_eq!(selected.reason, "PipelineNotReconciled");
    assert!(fixture.all("source.toolkit.fluxcd.io/v1beta2", "GitRepository").await.is_empty());
}

// ==========================================================================
// Forbidden apply
// ==========================================================================

#[tokio::test]
async fn test_forbidden_apply_is_handled() {
    let fixture = happy_fixture().await;
    fixture
        .substrate
        .deny(AccessRule::deny("system:serviceaccount:dev:default", Verb::Create, "ConfigMap"))
        .await;

    let action = fixture.reconcile_workload("app").await;
    assert!(matches!(action, Ok(Action::RequeueAfter(_))));

    let app = fixture.workload("app").await;
    let ready = condition(&app.status.owner.conditions, "Ready");
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "TemplateRejectedByAPIServer");
    assert!(fixture.all("v1", "ConfigMap").await.is_empty());
}

// ==========================================================================
// Output waiting
// ==========================================================================

#[tokio::test]
async fn test_outputs_arrive_on_a_later_tick() {
    let fixture = Fixture::new().await;
    ready_supply_chain(&fixture, CHAIN, "web").await;
    fixture.seed(workload("app", "web")).await;

    let action = fixture.reconcile_workload("app").await;
    assert!(matches!(action, Ok(Action::RequeueAfter(_))));

    let app = fixture.workload("app").await;
    let ready = condition(&app.status.owner.conditions, "Ready");
    assert_eq!(ready.status, ConditionStatus::Unknown);
    assert_eq!(ready.reason, "MissingValueAtPath");
    assert!(ready.message.contains("[build]"));
    assert!(ready.message.contains(".status.artifact.url"));
    assert!(fixture.all("v1", "ConfigMap").await.is_empty());

    fixture
        .substrate
        .seed_status(
            &TypeMeta::new("source.toolkit.fluxcd.io/v1beta2", "GitRepository"),
            &ObjectKey::namespaced(NAMESPACE, "app-source"),
            json!({"artifact": {"url": ARTIFACT_URL}}),
        )
        .await
        .unwrap();

    fixture.reconcile_workload("app").await.unwrap();
    let app = fixture.workload("app").await;
    assert_eq!(condition(&app.status.owner.conditions, "Ready").status, ConditionStatus::True);
    assert_eq!(fixture.all("v1", "ConfigMap").await.len(), 1);
}

// ==========================================================================
// Cache effectiveness
// ==========================================================================

#[tokio::test]
async fn test_steady_tick_issues_no_writes() {
    let fixture = happy_fixture().await;
    fixture.reconcile_workload("app").await.unwrap();

    let writes = fixture.substrate.stats();
    let hits = fixture.ctx.repo.cache().stats().hits;
    let before: Workload = fixture.workload("app").await;

    fixture.reconcile_workload("app").await.unwrap();

    let after = fixture.substrate.stats();
    assert_eq!(after.object_writes(), writes.object_writes());
    assert_eq!(after.status_updates, writes.status_updates);
    assert_eq!(fixture.ctx.repo.cache().stats().hits, hits + 2);
    assert_eq!(fixture.workload("app").await, before);
}

#[tokio::test]
async fn test_changed_spec_is_patched() {
    let fixture = happy_fixture().await;
    fixture.reconcile_workload("app").await.unwrap();
    let writes = fixture.substrate.stats().object_writes();

    let mut changed = workload("app", "web");
    changed["spec"]["source"]["git"]["url"] = json!("https://example.com/other.git");
    fixture.seed(changed).await;
    fixture.reconcile_workload("app").await.unwrap();

    assert_eq!(fixture.substrate.stats().object_writes(), writes + 1);
    let sources = fixture.all("source.toolkit.fluxcd.io/v1beta2", "GitRepository").await;
    assert_eq!(
        sources.first().and_then(|s| s.spec()).and_then(|s| s.get("url")),
        Some(&json!("https://example.com/other.git"))
    );
    let app = fixture.workload("app").await;
    assert_eq!(app.status.owner.observed_generation, app.metadata.generation);
}

// ==========================================================================
// Service accounts
// ==========================================================================

#[tokio::test]
async fn test_missing_service_account_is_handled() {
    let fixture = happy_fixture().await;
    let mut named = workload("named", "web");
    named["spec"]["serviceAccountName"] = json!("builder");
    fixture.seed(named).await;

    let action = fixture.reconcile_workload("named").await;
    assert!(matches!(action, Ok(Action::RequeueAfter(_))));

    let named = fixture.workload("named").await;
    let submitted = condition(&named.status.owner.conditions, "ResourcesSubmitted");
    assert_eq!(submitted.status, ConditionStatus::False);
    assert_eq!(submitted.reason, "ServiceAccountSecretError");
}

#[tokio::test]
async fn test_stamps_as_named_service_account() {
    let fixture = happy_fixture().await;
    fixture.service_account("builder").await;
    fixture
        .substrate
        .deny(AccessRule::deny("system:serviceaccount:dev:builder", Verb::Create, "*"))
        .await;
    let mut named = workload("named", "web");
    named["spec"]["serviceAccountName"] = json!("builder");
    fixture.seed(named).await;

    fixture.reconcile_workload("named").await.unwrap();

    let named = fixture.workload("named").await;
    assert_eq!(
        condition(&named.status.owner.conditions, "Ready").reason,
        "TemplateRejectedByAPIServer"
    );
}

#[tokio::test]
async fn test_client_builder_failure_is_unhandled() {
    let fixture = happy_fixture().await;
    fixture.substrate.set_client_error(Some("no credentials".to_string()));

    let result = fixture.reconcile_workload("app").await;
    assert!(result.is_err());

    let app = fixture.workload("app").await;
    assert_eq!(
        condition(&app.status.owner.conditions, "Ready").reason,
        "ResourceRealizerBuilderError"
    );
}

// ==========================================================================
// Health
// ==========================================================================

#[tokio::test]
async fn test_health_rule_gates_readiness() {
    let fixture = happy_fixture().await;
    let mut deploy = deploy_template();
    deploy["spec"]["healthRule"] = json!({"singleConditionType": "Ready"});
    fixture.seed(deploy).await;

    fixture.reconcile_workload("app").await.unwrap();
    let app = fixture.workload("app").await;
    let deploy_step = app.status.owner.resources.iter().find(|r| r.name == "deploy").unwrap();
    let healthy = condition(&deploy_step.conditions, "Healthy");
    assert_eq!((healthy.status, healthy.reason.as_str()), (ConditionStatus::Unknown, "ReadyCondition"));
    let resources_healthy = condition(&app.status.owner.conditions, "ResourcesHealthy");
    assert_eq!(resources_healthy.status, ConditionStatus::Unknown);
    assert_eq!(resources_healthy.reason, "HealthyConditionRule");
    assert_eq!(condition(&app.status.owner.conditions, "ResourcesSubmitted").status, ConditionStatus::True);
    assert_eq!(condition(&app.status.owner.conditions, "Ready").status, ConditionStatus::Unknown);

    fixture
        .substrate
        .seed_status(
            &TypeMeta::new("v1", "ConfigMap"),
            &ObjectKey::namespaced(NAMESPACE, "app-deploy"),
            json!({"conditions": [{"type": "Ready", "status": "True", "message": "serving"}]}),
        )
        .await
        .unwrap();
    fixture.reconcile_workload("app").await.unwrap();

    let app = fixture.workload("app").await;
    let resources_healthy = condition(&app.status.owner.conditions, "ResourcesHealthy");
    assert_eq!((resources_healthy.status, resources_healthy.reason.as_str()), (ConditionStatus::True, "HealthyConditionRule"));
    assert_eq!(condition(&app.status.owner.conditions, "Ready").status, ConditionStatus::True);
}

#[tokio::test]
async fn test_unhealthy_stamped_object_fails_readiness() {
    let fixture = happy_fixture().await;
    let mut deploy = deploy_template();
    deploy["spec"]["healthRule"] = json!({"multiMatch": {
        "healthy": {"matchConditions": [{"type": "Ready", "status": "True"}]},
        "unhealthy": {"matchConditions": [{"type": "Ready", "status": "False"}]}
    }});
    fixture.seed(deploy).await;
    fixture.reconcile_workload("app").await.unwrap();

    fixture
        .substrate
        .seed_status(
            &TypeMeta::new("v1", "ConfigMap"),
            &ObjectKey::namespaced(NAMESPACE, "app-deploy"),
            json!({"conditions": [{"type": "Ready", "status": "False", "message": "crashing"}]}),
        )
        .await
        .unwrap();
    fixture.reconcile_workload("app").await.unwrap();

    let app = fixture.workload("app").await;
    let ready = condition(&app.status.owner.conditions, "Ready");
    assert_eq!((ready.status, ready.reason.as_str()), (ConditionStatus::False, "HealthyConditionRule"));
    let deploy_step = app.status.owner.resources.iter().find(|r| r.name == "deploy").unwrap();
    let healthy = condition(&deploy_step.conditions, "Healthy");
    assert_eq!(healthy.reason, "MatchedCondition");
    assert!(healthy.message.contains("crashing"));
}

// ==========================================================================
// Orphaned objects
// ==========================================================================

async fn deploy_maps(fixture: &Fixture) -> Vec<String> {
    fixture
        .all("v1", "ConfigMap")
        .await
        .into_iter()
        .filter(|map| map.metadata.labels.get(labels::RESOURCE_NAME).map(String::as_str) == Some("deploy"))
        .map(|map| map.metadata.name)
        .collect()
}

#[tokio::test]
async fn test_renamed_stamped_object_replaces_the_old_one() {
    let fixture = happy_fixture().await;
    fixture.reconcile_workload("app").await.unwrap();
    assert_eq!(deploy_maps(&fixture).await, vec!["app-deploy".to_string()]);

    let mut renamed = deploy_template();
    renamed["spec"]["template"]["metadata"]["name"] = json!("$(workload.metadata.name)$-deploy-v2");
    fixture.seed(renamed).await;
    fixture.reconcile_workload("app").await.unwrap();

    assert_eq!(deploy_maps(&fixture).await, vec!["app-deploy-v2".to_string()]);
    let app = fixture.workload("app").await;
    let deploy_step = app.status.owner.resources.iter().find(|r| r.name == "deploy").unwrap();
    assert_eq!(deploy_step.stamped_ref.as_ref().map(|r| r.name.as_str()), Some("app-deploy-v2"));
}

#[tokio::test]
async fn test_removed_step_deletes_its_object() {
    let fixture = happy_fixture().await;
    fixture.reconcile_workload("app").await.unwrap();
    assert_eq!(fixture.all("v1", "ConfigMap").await.len(), 1);

    let mut chain = supply_chain(CHAIN, "web");
    chain["spec"]["resources"] = json!([
        {"name": "build", "templateRef": {"kind": "ClusterSourceTemplate", "name": "git"}}
    ]);
    fixture.seed(chain).await;
    fixture.reconcile_supply_chain(CHAIN).await.unwrap();
    fixture.reconcile_workload("app").await.unwrap();

    assert!(fixture.all("v1", "ConfigMap").await.is_empty());
    assert_eq!(fixture.all("source.toolkit.fluxcd.io/v1beta2", "GitRepository").await.len(), 1);
    let app = fixture.workload("app").await;
    assert_eq!(app.status.owner.resources.len(), 1);
}

// ==========================================================================
// Lifecycle
// ==========================================================================

#[tokio::test]
async fn test_deleted_workload_is_done() {
    let fixture = Fixture::new().await;
    assert!(matches!(fixture.reconcile_workload("gone").await, Ok(Action::Done)));
}

#[tokio::test]
async fn test_templates_are_tracked_for_the_workload() {
    let fixture = happy_fixture().await;
    fixture.reconcile_workload("app").await.unwrap();

    let template = choreo_reconciler::Reference::new(
        TypeMeta::new("carto.run/v1alpha1", "ClusterTemplate"),
        ObjectKey::cluster("deploy"),
    );
    let owners = fixture.ctx.tracker.lookup(&template);
    assert_eq!(owners.len(), 1);
    assert_eq!(owners.first().map(|o| o.key.name.as_str()), Some("app"));

    let watched = fixture.ctx.stamped.watched();
    assert!(watched.contains(&TypeMeta::new("v1", "ConfigMap")));
}
