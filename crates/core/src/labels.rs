//! Provenance labels placed on every stamped child.

pub const WORKLOAD_NAME: &str = "carto.run/workload-name";
pub const WORKLOAD_NAMESPACE: &str = "carto.run/workload-namespace";
pub const SUPPLY_CHAIN_NAME: &str = "carto.run/cluster-supply-chain-name";

pub const DELIVERABLE_NAME: &str = "carto.run/deliverable-name";
pub const DELIVERABLE_NAMESPACE: &str = "carto.run/deliverable-namespace";
pub const DELIVERY_NAME: &str = "carto.run/cluster-delivery-name";

pub const RUNNABLE_NAME: &str = "carto.run/runnable-name";
pub const RUNNABLE_NAMESPACE: &str = "carto.run/runnable-namespace";
pub const RUN_TEMPLATE_NAME: &str = "carto.run/run-template-name";

pub const RESOURCE_NAME: &str = "carto.run/resource-name";
pub const TEMPLATE_KIND: &str = "carto.run/template-kind";
pub const TEMPLATE_NAME: &str = "carto.run/cluster-template-name";
pub const TEMPLATE_LIFECYCLE: &str = "carto.run/template-lifecycle";
