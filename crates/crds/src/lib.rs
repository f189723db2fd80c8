//! vSphere infrastructure CRD definitions
//!
//! Kubernetes Custom Resource Definitions for the vSphere cluster and VM
//! controllers, plus the subset of Cluster API core types they read.

pub mod capi;
pub mod cluster_identity;
pub mod conditions;
pub mod constants;
pub mod deployment_zone;
pub mod vsphere_cluster;
pub mod vsphere_machine;
pub mod vsphere_vm;

pub use capi::*;
pub use cluster_identity::*;
pub use conditions::{
    CCM_AVAILABLE_CONDITION, CONTROL_PLANE_INITIALIZED_CONDITION, CSI_AVAILABLE_CONDITION, Condition,
    ConditionSeverity, ConditionStatus, DELETING_REASON, DELETION_FAILED_REASON,
    FAILURE_DOMAINS_AVAILABLE_CONDITION, FAILURE_DOMAINS_SKIPPED_REASON, HasConditions, READY_CONDITION,
    VCENTER_AVAILABLE_CONDITION, VCENTER_UNREACHABLE_REASON, VM_PROVISIONED_CONDITION,
    WAITING_FOR_FAILURE_DOMAIN_STATUS_REASON, WAITING_FOR_STATIC_IP_ALLOCATION_REASON,
};
pub use constants::*;
pub use deployment_zone::*;
pub use vsphere_cluster::*;
pub use vsphere_machine::*;
pub use vsphere_vm::*;
