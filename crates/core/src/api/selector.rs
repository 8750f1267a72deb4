//! Selector predicates carried by pipelines and template options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One `key op values` predicate.
///
/// The operator stays a string so that an unknown operator surfaces as a
/// selection error naming the pipeline, not as a parse failure of the object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl SelectorRequirement {
    /// Create a requirement.
    pub fn new<I, S>(key: impl Into<String>, operator: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            operator: operator.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// The three predicate groups a pipeline selects intents with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    /// Label equality map.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    /// Label expressions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selector_match_expressions: Vec<SelectorRequirement>,
    /// Field expressions over the intent object.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selector_match_fields: Vec<SelectorRequirement>,
}

impl Selector {
    /// Total number of predicates across all three groups.
    #[must_use]
    pub fn predicate_count(&self) -> usize {
        self.selector.len()
            + self.selector_match_expressions.len()
            + self.selector_match_fields.len()
    }
}

/// Field predicates used to pick one template option.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionSelector {
    #[serde(default)]
    pub match_fields: Vec<SelectorRequirement>,
}
