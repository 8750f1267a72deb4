//! Status conditions and the manager that folds them into a top-level `Ready`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// A single status condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub observed_generation: i64,
}

impl Condition {
    /// Create a condition stamped with the current time.
    pub fn new(type_: impl Into<String>, status: ConditionStatus, reason: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: String::new(),
            last_transition_time: Utc::now(),
            observed_generation: 0,
        }
    }

    /// Attach a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    fn same_state(&self, other: &Self) -> bool {
        self.status == other.status && self.reason == other.reason
    }

    fn same_content(&self, other: &Self) -> bool {
        self.same_state(other)
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Find a condition by type.
#[must_use]
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Which status of a condition counts as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// `True` is success.
    Positive,
    /// `False` is success.
    Negative,
}

/// Collects conditions for one status write and derives the top-level condition.
///
/// The top-level condition is `True` only if every added condition succeeded.
/// Otherwise it mirrors the reason and message of the first failing condition,
/// where `False` outranks `Unknown`.
#[derive(Debug, Clone)]
pub struct ConditionManager {
    top_level_type: String,
    previous: Vec<Condition>,
    conditions: Vec<Condition>,
    status: ConditionStatus,
    cause: Option<(String, String)>,
    generation: i64,
    changed: bool,
}

impl ConditionManager {
    /// Create a manager comparing against `previous`.
    pub fn new(top_level_type: impl Into<String>, previous: &[Condition]) -> Self {
        Self {
            top_level_type: top_level_type.into(),
            previous: previous.to_vec(),
            conditions: Vec::new(),
            status: ConditionStatus::True,
            cause: None,
            generation: 0,
            changed: false,
        }
    }

    /// Stamp every condition with the generation it was computed for.
    #[must_use]
    pub const fn with_generation(mut self, generation: i64) -> Self {
        self.generation = generation;
        self
    }

    /// Add a condition with the given polarity.
    pub fn add(&mut self, mut condition: Condition, polarity: Polarity) {
        condition.observed_generation = self.generation;

        let failed = matches!(
            (condition.status, polarity),
            (ConditionStatus::False, Polarity::Positive) | (ConditionStatus::True, Polarity::Negative)
        );
        if failed {
            if self.status != ConditionStatus::False {
                self.cause = Some((condition.reason.clone(), condition.message.clone()));
            }
            self.status = ConditionStatus::False;
        } else if condition.status == ConditionStatus::Unknown && self.status == ConditionStatus::True {
            self.cause = Some((condition.reason.clone(), condition.message.clone()));
            self.status = ConditionStatus::Unknown;
        }

        match find(&self.previous, &condition.type_) {
            Some(previous) => {
                if condition.same_state(previous) {
                    condition.last_transition_time = previous.last_transition_time;
                }
                if !condition.same_content(previous) {
                    self.changed = true;
                }
            }
            None => self.changed = true,
        }

        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }

    /// Add a condition where `True` is success.
    pub fn add_positive(&mut self, condition: Condition) {
        self.add(condition, Polarity::Positive);
    }

    /// Add a condition where `False` is success.
    pub fn add_negative(&mut self, condition: Condition) {
        self.add(condition, Polarity::Negative);
    }

    /// False once any failing condition has been added.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.status != ConditionStatus::False
    }

    /// Append the top-level condition and return all conditions plus whether
    /// they differ from the previous set.
    #[must_use]
    pub fn finalize(mut self) -> (Vec<Condition>, bool) {
        let top_level = if self.conditions.is_empty() {
            Condition::new(self.top_level_type.clone(), ConditionStatus::Unknown, "Unknown")
        } else {
            match (self.status, self.cause.take()) {
                (ConditionStatus::True, _) | (_, None) => Condition::new(
                    self.top_level_type.clone(),
                    self.status,
                    "Ready",
                ),
                (status, Some((reason, message))) => {
                    Condition::new(self.top_level_type.clone(), status, reason).with_message(message)
                }
            }
        };
        self.add_positive(top_level);

        let dropped = self
            .previous
            .iter()
            .any(|p| find(&self.conditions, &p.type_).is_none());

        (self.conditions, self.changed || dropped)
    }
}
