//! Runnable reconciliation.
//!
//! Properties tested:
//! - each distinct set of inputs stamps one new run, steady ticks stamp none
//! - outputs come from the newest run whose `Succeeded` condition is `True`
//! - outputs survive until a newer run succeeds
//! - the runnable mirrors its newest run's `Succeeded` condition
//! - finished runs beyond the retention policy are deleted
//! - a selector must resolve to exactly one object

mod common;

use std::time::Duration;

use choreo_core::api::Runnable;
use choreo_core::{labels, ConditionStatus, DynamicObject, ObjectKey, TypeMeta};
use choreo_reconciler::{Action, Error, RealizeError};
use common::{condition, Fixture, NAMESPACE};
use serde_json::{json, Value};

const RUN_API: &str = "tekton.dev/v1beta1";
const RUN_KIND: &str = "TaskRun";

fn run_template() -> Value {
    json!({
        "apiVersion": "carto.run/v1alpha1",
        "kind": "ClusterRunTemplate",
        "metadata": {"name": "tekton-run"},
        "spec": {
            "template": {
                "apiVersion": RUN_API,
                "kind": RUN_KIND,
                "metadata": {"generateName": "$(runnable.metadata.name)$-"},
                "spec": {"params": [{"name": "revision", "value": "$(inputs.revision)$"}]}
            },
            "outputs": {"image": ".status.results.image"}
        }
    })
}

fn runnable(revision: &str) -> Value {
    json!({
        "apiVersion": "carto.run/v1alpha1",
        "kind": "Runnable",
        "metadata": {"name": "test", "namespace": NAMESPACE},
        "spec": {
            "runTemplateRef": {"name": "tekton-run"},
            "inputs": {"revision": revision},
            "retentionPolicy": {"maxSuccessfulRuns": 1, "maxFailedRuns": 1}
        }
    })
}

async fn fixture() -> Fixture {
    let fixture = Fixture::new().await;
    fixture.seed(run_template()).await;
    fixture
}

async fn runs(fixture: &Fixture) -> Vec<DynamicObject> {
    fixture.all(RUN_API, RUN_KIND).await
}

async fn runnable_status(fixture: &Fixture) -> Runnable {
    fixture.get(&ObjectKey::namespaced(NAMESPACE, "test")).await
}

/// Mark a run finished, as the run's own controller would.
async fn finish(fixture: &Fixture, name: &str, succeeded: bool, image: &str) {
    let status = if succeeded { "True" } else { "False" };
    fixture
        .substrate
        .seed_status(
            &TypeMeta::new(RUN_API, RUN_KIND),
            &ObjectKey::namespaced(NAMESPACE, name),
            json!({
                "conditions": [{
                    "type": "Succeeded",
                    "status": status,
                    "reason": "Finished",
                    "lastTransitionTime": "2024-01-01T00:00:00Z"
                }],
                "results": {"image": image}
            }),
        )
        .await
        .unwrap();
}

/// Name of the one run whose revision param is `revision`.
async fn run_for(fixture: &Fixture, revision: &str) -> String {
    runs(fixture)
        .await
        .into_iter()
        .find(|run| {
            run.spec()
                .and_then(|s| s.pointer("/params/0/value"))
                .and_then(Value::as_str)
                == Some(revision)
        })
        .map(|run| run.metadata.name)
        .unwrap()
}

// ==========================================================================
// Stamping
// ==========================================================================

#[tokio::test]
async fn test_one_run_per_input_set() {
    let fixture = fixture().await;
    fixture.seed(runnable("abc")).await;

    fixture.reconcile_runnable("test").await.unwrap();
    fixture.reconcile_runnable("test").await.unwrap();

    let created = runs(&fixture).await;
    assert_eq!(created.len(), 1);
    let run = created.first().unwrap();
    assert!(run.metadata.name.starts_with("test-"));
    assert_eq!(run.metadata.labels.get(labels::RUNNABLE_NAME).map(String::as_str), Some("test"));
    assert_eq!(run.metadata.labels.get(labels::RUN_TEMPLATE_NAME).map(String::as_str), Some("tekton-run"));
    assert_eq!(run.metadata.labels.get(labels::TEMPLATE_LIFECYCLE).map(String::as_str), Some("immutable"));
    assert_eq!(fixture.substrate.stats().patches, 0);

    fixture.seed(runnable("def")).await;
    fixture.reconcile_runnable("test").await.unwrap();
    assert_eq!(runs(&fixture).await.len(), 2);
}

#[tokio::test]
async fn test_running_run_is_not_ready_until_it_succeeds() {
    let fixture = fixture().await;
    fixture.seed(runnable("abc")).await;

    let action = fixture.reconcile_runnable("test").await;
    assert!(matches!(action, Ok(Action::RequeueAfter(_))));

    let status = runnable_status(&fixture).await;
    let conditions = &status.status.owner.conditions;
    assert_eq!(condition(conditions, "RunTemplateReady").status, ConditionStatus::True);
    let stamped = condition(conditions, "StampedObjectCondition");
    assert_eq!((stamped.status, stamped.reason.as_str()), (ConditionStatus::Unknown, "Unknown"));
    assert_eq!(condition(conditions, "Ready").status, ConditionStatus::Unknown);
    assert!(status.status.outputs.is_empty());

    let run = run_for(&fixture, "abc").await;
    finish(&fixture, &run, true, "image@sha256:aaa").await;
    fixture.reconcile_runnable("test").await.unwrap();

    let status = runnable_status(&fixture).await;
    let conditions = &status.status.owner.conditions;
    let stamped = condition(conditions, "StampedObjectCondition");
    assert_eq!((stamped.status, stamped.reason.as_str()), (ConditionStatus::True, "SucceededCondition"));
    assert_eq!(condition(conditions, "Ready").status, ConditionStatus::True);
}

#[tokio::test]
async fn test_failed_run_makes_runnable_not_ready() {
    let fixture = fixture().await;
    fixture.seed(runnable("abc")).await;
    fixture.reconcile_runnable("test").await.unwrap();

    let run = run_for(&fixture, "abc").await;
    finish(&fixture, &run, false, "image@sha256:bad").await;
    fixture.reconcile_runnable("test").await.unwrap();

    let status = runnable_status(&fixture).await;
    let ready = condition(&status.status.owner.conditions, "Ready");
    assert_eq!((ready.status, ready.reason.as_str()), (ConditionStatus::False, "SucceededCondition"));
    assert_eq!(condition(&status.status.owner.conditions, "RunTemplateReady").status, ConditionStatus::True);
}

// ==========================================================================
// Outputs
// ==========================================================================

#[tokio::test]
async fn test_outputs_follow_latest_success() {
    let fixture = fixture().await;
    fixture.seed(runnable("abc")).await;
    fixture.reconcile_runnable("test").await.unwrap();

    let first = run_for(&fixture, "abc").await;
    finish(&fixture, &first, true, "image@sha256:aaa").await;
    fixture.reconcile_runnable("test").await.unwrap();
    let status = runnable_status(&fixture).await;
    assert_eq!(status.status.outputs.get("image"), Some(&json!("image@sha256:aaa")));

    // A new run that has not finished leaves the old outputs in place.
    tokio::time::sleep(Duration::from_millis(5)).await;
    fixture.seed(runnable("def")).await;
    fixture.reconcile_runnable("test").await.unwrap();
    let status = runnable_status(&fixture).await;
    assert_eq!(status.status.outputs.get("image"), Some(&json!("image@sha256:aaa")));

    let second = run_for(&fixture, "def").await;
    finish(&fixture, &second, true, "image@sha256:bbb").await;
    fixture.reconcile_runnable("test").await.unwrap();
    let status = runnable_status(&fixture).await;
    assert_eq!(status.status.outputs.get("image"), Some(&json!("image@sha256:bbb")));
}

#[tokio::test]
async fn test_failed_run_produces_no_outputs() {
    let fixture = fixture().await;
    fixture.seed(runnable("abc")).await;
    fixture.reconcile_runnable("test").await.unwrap();

    let run = run_for(&fixture, "abc").await;
    finish(&fixture, &run, false, "image@sha256:bad").await;
    fixture.reconcile_runnable("test").await.unwrap();

    assert!(runnable_status(&fixture).await.status.outputs.is_empty());
}

// ==========================================================================
// Retention
// ==========================================================================

#[tokio::test]
async fn test_finished_runs_beyond_policy_are_collected() {
    let fixture = fixture().await;

    for revision in ["r1", "r2"] {
        fixture.seed(runnable(revision)).await;
        fixture.reconcile_runnable("test").await.unwrap();
        let run = run_for(&fixture, revision).await;
        finish(&fixture, &run, true, revision).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let oldest = run_for(&fixture, "r1").await;

    fixture.seed(runnable("r3")).await;
    fixture.reconcile_runnable("test").await.unwrap();

    let remaining: Vec<String> = runs(&fixture).await.into_iter().map(|r| r.metadata.name).collect();
    assert_eq!(remaining.len(), 2);
    assert!(!remaining.contains(&oldest));
    assert_eq!(fixture.substrate.stats().deletes, 1);
}

// ==========================================================================
// Failures
// ==========================================================================

#[tokio::test]
async fn test_missing_run_template_is_unhandled() {
    let fixture = Fixture::new().await;
    fixture.seed(runnable("abc")).await;

    let result = fixture.reconcile_runnable("test").await;
    assert!(matches!(result, Err(Error::Realize(RealizeError::GetTemplate { .. }))));

    let status = runnable_status(&fixture).await;
    let ready = condition(&status.status.owner.conditions, "RunTemplateReady");
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "RunTemplateNotFound");
}

#[tokio::test]
async fn test_selector_exposes_selected_object() {
    let fixture = Fixture::new().await;
    fixture
        .seed(json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "ClusterRunTemplate",
            "metadata": {"name": "tekton-run"},
            "spec": {"template": {
                "apiVersion": RUN_API,
                "kind": RUN_KIND,
                "metadata": {"generateName": "run-"},
                "spec": {"pipeline": "$(selected.metadata.name)$"}
            }}
        }))
        .await;
    let mut selecting = runnable("abc");
    selecting["spec"]["selector"] = json!({
        "resource": {"apiVersion": "tekton.dev/v1beta1", "kind": "Pipeline"},
        "matchingLabels": {"apps.tanzu.vmware.com/pipeline": "test"}
    });
    fixture.seed(selecting).await;

    fixture.reconcile_runnable("test").await.unwrap();
    let status = runnable_status(&fixture).await;
    let ready = condition(&status.status.owner.conditions, "RunTemplateReady");
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "SelectorNotMatched");
    assert!(runs(&fixture).await.is_empty());

    fixture
        .seed(json!({
            "apiVersion": "tekton.dev/v1beta1",
            "kind": "Pipeline",
            "metadata": {
                "name": "unit-tests",
                "namespace": NAMESPACE,
                "labels": {"apps.tanzu.vmware.com/pipeline": "test"}
            }
        }))
        .await;
    fixture.reconcile_runnable("test").await.unwrap();

    let created = runs(&fixture).await;
    assert_eq!(
        created.first().and_then(|r| r.spec()).and_then(|s| s.get("pipeline")),
        Some(&json!("unit-tests"))
    );
}
