//! Retention of finished immutable children.

use choreo_core::api::RetentionPolicy;
use choreo_core::conditions::ConditionStatus;
use choreo_core::DynamicObject;
use tracing::{debug, warn};

use super::outputs::{newest_first, succeeded};
use crate::repository::Repository;

/// Children beyond the retention limits, successful runs before failed ones.
/// Children still running are never selected.
#[must_use]
pub fn expired(children: &[DynamicObject], policy: RetentionPolicy) -> Vec<&DynamicObject> {
    let ordered = newest_first(children);
    let finished = |wanted: ConditionStatus| {
        ordered
            .iter()
            .copied()
            .filter(move |child| succeeded(child) == Some(wanted))
    };

    finished(ConditionStatus::True)
        .skip(policy.max_successful_runs)
        .chain(finished(ConditionStatus::False).skip(policy.max_failed_runs))
        .collect()
}

/// Delete expired children. Failures are logged; collection is retried on
/// the next reconcile.
pub async fn collect(repo: &Repository, children: &[DynamicObject], policy: RetentionPolicy) -> usize {
    let mut deleted = 0usize;
    for child in expired(children, policy) {
        match repo.delete(child).await {
            Ok(()) => {
                debug!(kind = %child.type_meta(), key = %child.key(), "Collected expired child");
                deleted = deleted.saturating_add(1);
            }
            Err(e) => warn!(kind = %child.type_meta(), key = %child.key(), error = %e, "Failed to collect expired child"),
        }
    }
    deleted
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn run(name: &str, minutes_ago: i64, status: Option<&str>) -> DynamicObject {
        let conditions = status.map_or_else(Vec::new, |s| {
            vec![json!({"type": "Succeeded", "status": s, "reason": "", "lastTransitionTime": "2024-01-01T00:00:00Z"})]
        });
        let mut obj = DynamicObject::from_value(json!({
            "apiVersion": "tekton.dev/v1beta1",
            "kind": "TaskRun",
            "metadata": {"name": name, "namespace": "dev"},
            "status": {"conditions": conditions}
        }))
        .unwrap();
        obj.metadata.creation_timestamp = Some(Utc::now() - Duration::minutes(minutes_ago));
        obj
    }

    fn names(found: &[&DynamicObject]) -> Vec<String> {
        found.iter().map(|c| c.metadata.name.clone()).collect()
    }

    #[test]
    fn test_keeps_newest_within_limits() {
        let children = vec![
            run("ok-old", 30, Some("True")),
            run("ok-mid", 20, Some("True")),
            run("ok-new", 10, Some("True")),
            run("bad-old", 25, Some("False")),
            run("bad-new", 5, Some("False")),
            run("running", 40, None),
        ];
        let policy = RetentionPolicy {
            max_successful_runs: 2,
            max_failed_runs: 1,
        };

        assert_eq!(names(&expired(&children, policy)), vec!["ok-old", "bad-old"]);
    }

    #[test]
    fn test_nothing_expires_under_default_policy() {
        let children = vec![run("a", 2, Some("True")), run("b", 1, Some("False"))];
        assert!(expired(&children, RetentionPolicy::default()).is_empty());
    }
}
