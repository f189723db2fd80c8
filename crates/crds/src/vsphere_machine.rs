//! VSphereMachine CRD
//!
//! Per-machine infrastructure resource. Owns the `VSphereVM` that backs it
//! and is labelled with the name of its Cluster API cluster.

use crate::constants::{CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VSphereMachine",
    namespaced,
    status = "VSphereMachineStatus",
    shortname = "vsm"
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineSpec {
    /// Provider ID assigned once the VM exists
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "providerID")]
    pub provider_id: Option<String>,

    /// Failure domain the machine is placed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,

    /// Template to clone from
    #[serde(default)]
    pub template: String,
}

/// Address type as used by Cluster API
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum MachineAddressType {
    /// Routable address
    ExternalIP,
    /// Cluster-internal address
    InternalIP,
    /// Externally resolvable name
    ExternalDNS,
    /// Internally resolvable name
    InternalDNS,
    /// Host name
    Hostname,
}

/// A single machine address
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct MachineAddress {
    /// Address type
    #[serde(rename = "type")]
    pub type_: MachineAddressType,

    /// The address
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineStatus {
    /// Machine is ready
    #[serde(default)]
    pub ready: bool,

    /// Addresses of the backing VM
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,
}

impl VSphereMachine {
    /// Whether the machine carries the control-plane label
    pub fn is_control_plane(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(CONTROL_PLANE_LABEL))
    }

    /// Name of the owning Cluster API cluster from the cluster-name label
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()?
            .get(CLUSTER_NAME_LABEL)
            .map(String::as_str)
    }

    /// First external address that parses as an IP
    pub fn preferred_ip_address(&self) -> Option<IpAddr> {
        self.status
            .as_ref()?
            .addresses
            .iter()
            .filter(|a| a.type_ == MachineAddressType::ExternalIP)
            .find_map(|a| a.address.parse().ok())
    }
}
