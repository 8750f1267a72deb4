//! API types for every kind the engine reads or writes.

pub mod blueprint;
pub mod core_v1;
pub mod intent;
pub mod selector;
pub mod status;
pub mod template;

/// Group and version of every engine kind.
pub const GROUP_VERSION: &str = "carto.run/v1alpha1";

pub use blueprint::{
    Blueprint, BlueprintParam, BlueprintSpec, ClusterDelivery, ClusterSupplyChain,
    PipelineResource, ServiceAccountRef, StepInput, TemplateOption, TemplateReference,
};
pub use core_v1::{LocalObjectReference, Secret, ServiceAccount, SERVICE_ACCOUNT_TOKEN_TYPE};
pub use intent::{
    Deliverable, DeliverableStatus, Owner, OwnerParam, OwnerSpec, ResourceSelector, ResourceType,
    RetentionPolicy, RunTemplateReference, Runnable, RunnableSpec, RunnableStatus, Workload,
    WorkloadStatus,
};
pub use selector::{OptionSelector, Selector, SelectorRequirement};
pub use status::{
    BlueprintStatus, ObjectReference, OwnerStatus, RealizedResource, ResourceInput,
    ResourceOutput,
};
pub use template::{
    ClusterRunTemplate, ConditionRequirement, HealthMatchFieldRequirement, HealthMatchRule,
    HealthRule, Lifecycle, MultiMatchHealthRule, RunTemplateSpec, Template, TemplateKind,
    TemplateParam, TemplateSpec,
};
