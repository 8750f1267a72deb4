//! Failures of a single step.

use thiserror::Error;

use crate::repository::RepositoryError;
use crate::stamp::StampError;

/// What went wrong while realizing one step.
///
/// Each variant is either handled (recorded as a condition, the reconcile
/// succeeds) or unhandled (recorded, then returned so the key is retried
/// with backoff). See [`RealizeError::is_handled`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealizeError {
    #[error("unable to get template [{name}] for step [{step}]: {reason}")]
    GetTemplate {
        step: String,
        kind: String,
        name: String,
        reason: String,
    },

    #[error("error matching against template option [{option}] for step [{step}]: {reason}")]
    ResolveTemplateOption {
        step: String,
        option: String,
        reason: String,
    },

    #[error("expected exactly 1 option to match, found [{}] matching options [{}] for step [{step}]", .matched.len(), .matched.join(", "))]
    TemplateOptionsMatch { step: String, matched: Vec<String> },

    #[error("Waiting to read value [{output}] from step [{from_step}] for input [{input}] of step [{step}]")]
    MissingInput {
        step: String,
        input: String,
        from_step: String,
        output: String,
    },

    #[error("unable to stamp object for step [{step}] from template [{template}]: {source}")]
    Stamp {
        step: String,
        template: String,
        #[source]
        source: StampError,
    },

    #[error("unable to apply object [{namespace}/{name}] for step [{step}]: {source}")]
    ApplyStampedObject {
        step: String,
        kind: String,
        namespace: String,
        name: String,
        #[source]
        source: RepositoryError,
    },

    #[error("unable to list objects created for step [{step}]: {source}")]
    ListCreatedObjects {
        step: String,
        kind: String,
        #[source]
        source: RepositoryError,
    },

    #[error("Waiting to read value [{expression}] from resource [{resource}] in namespace [{namespace}] for step [{step}]")]
    RetrieveOutput {
        step: String,
        expression: String,
        resource: String,
        namespace: String,
        reason: String,
    },

    #[error("unable to resolve selector {selector}, apiVersion {api_version}, kind {kind}: {reason}")]
    SelectorNotMatched {
        api_version: String,
        kind: String,
        selector: String,
        reason: String,
    },
}

impl RealizeError {
    /// True if the failure is only recorded; false if the reconcile must be retried.
    #[must_use]
    pub const fn is_handled(&self) -> bool {
        match self {
            Self::GetTemplate { .. } | Self::ListCreatedObjects { .. } => false,
            Self::ApplyStampedObject { source, .. } => source.is_forbidden(),
            Self::ResolveTemplateOption { .. }
            | Self::TemplateOptionsMatch { .. }
            | Self::MissingInput { .. }
            | Self::Stamp { .. }
            | Self::RetrieveOutput { .. }
            | Self::SelectorNotMatched { .. } => true,
        }
    }

    /// True for failures that mean "not yet" rather than "broken".
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, Self::MissingInput { .. } | Self::RetrieveOutput { .. })
    }

    /// Condition reason for this failure on a resource axis.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::GetTemplate { .. } => "TemplateObjectRetrievalFailure",
            Self::ResolveTemplateOption { .. } => "ResolveTemplateOptionsError",
            Self::TemplateOptionsMatch { .. } => "TemplateOptionsMatchError",
            Self::MissingInput { .. } | Self::RetrieveOutput { .. } => "MissingValueAtPath",
            Self::Stamp { .. } => "TemplateStampFailure",
            Self::ApplyStampedObject { .. } => "TemplateRejectedByAPIServer",
            Self::ListCreatedObjects { .. } => "FailedToListCreatedObjects",
            Self::SelectorNotMatched { .. } => "SelectorNotMatched",
        }
    }

    /// The step that failed, if the failure belongs to one.
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::GetTemplate { step, .. }
            | Self::ResolveTemplateOption { step, .. }
            | Self::TemplateOptionsMatch { step, .. }
            | Self::MissingInput { step, .. }
            | Self::Stamp { step, .. }
            | Self::ApplyStampedObject { step, .. }
            | Self::ListCreatedObjects { step, .. }
            | Self::RetrieveOutput { step, .. } => Some(step),
            Self::SelectorNotMatched { .. } => None,
        }
    }
}
