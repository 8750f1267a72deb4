//! Pipeline selection by label and field predicates.
//!
//! Every predicate of a candidate must hold. Among the surviving candidates
//! the ones satisfying the most predicates are kept, and of those the ones
//! with the fewest predicates overall. Ties are returned as-is; the caller
//! decides what zero or several matches mean. A candidate with no predicates
//! never matches.

use std::collections::BTreeMap;

use choreo_core::api::{Selector, SelectorRequirement};
use choreo_core::JsonPath;
use serde_json::Value;
use thiserror::Error;

/// A predicate that cannot be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("selector of '{candidate}' has an invalid predicate '{predicate}': {reason}")]
pub struct SelectorError {
    pub candidate: String,
    pub predicate: String,
    pub reason: String,
}

/// Something pipelines can select: labels plus a JSON rendering for field paths.
#[derive(Debug, Clone)]
pub struct Selectable<'a> {
    labels: &'a BTreeMap<String, String>,
    fields: &'a Value,
}

impl<'a> Selectable<'a> {
    /// Create a selectable.
    #[must_use]
    pub const fn new(labels: &'a BTreeMap<String, String>, fields: &'a Value) -> Self {
        Self { labels, fields }
    }
}

/// A candidate that carries a selector.
pub trait Candidate {
    /// Name used in error messages.
    fn candidate_name(&self) -> &str;

    /// The candidate's predicates.
    fn selector(&self) -> &Selector;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

fn parse_operator(requirement: &SelectorRequirement) -> Result<Operator, String> {
    let operator = match requirement.operator.as_str() {
        "In" => Operator::In,
        "NotIn" => Operator::NotIn,
        "Exists" => Operator::Exists,
        "DoesNotExist" => Operator::DoesNotExist,
        other => return Err(format!("unknown operator '{other}'")),
    };
    match (operator, requirement.values.is_empty()) {
        (Operator::In | Operator::NotIn, true) => {
            Err(format!("operator '{}' needs at least one value", requirement.operator))
        }
        (Operator::Exists | Operator::DoesNotExist, false) => {
            Err(format!("operator '{}' takes no values", requirement.operator))
        }
        _ => Ok(operator),
    }
}

fn describe(requirement: &SelectorRequirement) -> String {
    if requirement.values.is_empty() {
        format!("{} {}", requirement.key, requirement.operator)
    } else {
        format!(
            "{} {} [{}]",
            requirement.key,
            requirement.operator,
            requirement.values.join(", ")
        )
    }
}

/// Render a selected field for comparison against string values.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate a label expression. An absent label satisfies `NotIn`.
///
/// # Errors
///
/// Returns a reason string when the requirement is malformed.
pub fn label_requirement_matches(
    requirement: &SelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, String> {
    let actual = labels.get(&requirement.key);
    Ok(match parse_operator(requirement)? {
        Operator::In => actual.is_some_and(|v| requirement.values.contains(v)),
        Operator::NotIn => actual.is_none_or(|v| !requirement.values.contains(v)),
        Operator::Exists => actual.is_some(),
        Operator::DoesNotExist => actual.is_none(),
    })
}

/// Evaluate a field expression against an object rendered as JSON. A missing
/// path fails `In` and `NotIn`.
///
/// # Errors
///
/// Returns a reason string when the requirement or its path is malformed.
pub fn field_requirement_matches(requirement: &SelectorRequirement, fields: &Value) -> Result<bool, String> {
    let operator = parse_operator(requirement)?;
    let path = JsonPath::parse(&requirement.key).map_err(|e| e.to_string())?;
    let found: Vec<String> = path.query(fields).into_iter().map(render).collect();
    Ok(match operator {
        Operator::In => found.iter().any(|v| requirement.values.contains(v)),
        Operator::NotIn => !found.is_empty() && found.iter().all(|v| !requirement.values.contains(v)),
        Operator::Exists => !found.is_empty(),
        Operator::DoesNotExist => found.is_empty(),
    })
}

/// Count of satisfied predicates, or `None` if any predicate fails.
fn satisfied(candidate: &impl Candidate, target: &Selectable<'_>) -> Result<Option<usize>, SelectorError> {
    let selector = candidate.selector();
    let error = |predicate: String, reason: String| SelectorError {
        candidate: candidate.candidate_name().to_string(),
        predicate,
        reason,
    };

    let labels_hold = selector
        .selector
        .iter()
        .all(|(k, v)| target.labels.get(k) == Some(v));

    let mut all_hold = labels_hold;
    for requirement in &selector.selector_match_expressions {
        let holds = label_requirement_matches(requirement, target.labels)
            .map_err(|reason| error(describe(requirement), reason))?;
        all_hold &= holds;
    }
    for requirement in &selector.selector_match_fields {
        let holds = field_requirement_matches(requirement, target.fields)
            .map_err(|reason| error(describe(requirement), reason))?;
        all_hold &= holds;
    }

    Ok(all_hold.then(|| selector.predicate_count()))
}

/// The best-matching candidates for `target`.
///
/// # Errors
///
/// Returns an error naming the candidate and predicate if any predicate of
/// any candidate is malformed.
pub fn best_matches<'c, C: Candidate>(
    target: &Selectable<'_>,
    candidates: &'c [C],
) -> Result<Vec<&'c C>, SelectorError> {
    let mut survivors = Vec::new();
    for candidate in candidates {
        let total = candidate.selector().predicate_count();
        if total == 0 {
            continue;
        }
        if let Some(count) = satisfied(candidate, target)? {
            survivors.push((candidate, count, total));
        }
    }

    let Some(most_satisfied) = survivors.iter().map(|(_, count, _)| *count).max() else {
        return Ok(Vec::new());
    };
    survivors.retain(|(_, count, _)| *count == most_satisfied);

    let fewest_total = survivors
        .iter()
        .map(|(_, _, total)| *total)
        .min()
        .unwrap_or_default();
    Ok(survivors
        .into_iter()
        .filter(|(_, _, total)| *total == fewest_total)
        .map(|(candidate, _, _)| candidate)
        .collect())
}
