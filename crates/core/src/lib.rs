//! Core types for the choreo engine.
//!
//! - [`object`]: typed and unstructured objects, metadata, owner references
//! - [`api`]: intents, pipelines, templates and the core kinds they touch
//! - [`conditions`]: status conditions and the top-level `Ready` fold
//! - [`eval`]: the JSON-path subset used by selectors, templates and outputs
//! - [`labels`]: provenance labels on stamped children

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod api;
pub mod conditions;
pub mod error;
pub mod eval;
pub mod labels;
pub mod object;
pub mod result;

pub use conditions::{Condition, ConditionManager, ConditionStatus, Polarity};
pub use error::Error;
pub use eval::JsonPath;
pub use object::{DynamicObject, ObjectKey, ObjectMeta, OwnerReference, Resource, TypeMeta};
pub use result::{Result, ResultExt};
