//! VSphereVM CRD
//!
//! A single virtual machine on vSphere, usually owned by a `VSphereMachine`.

use crate::conditions::{Condition, HasConditions};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VSphereVM",
    namespaced,
    status = "VSphereVMStatus",
    shortname = "vsvm"
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereVMSpec {
    /// vCenter endpoint
    pub server: String,

    /// Datacenter the VM lives in
    #[serde(default)]
    pub datacenter: String,

    /// SHA-1 thumbprint of the vCenter certificate; empty means insecure
    #[serde(default)]
    pub thumbprint: String,

    /// Template to clone from
    #[serde(default)]
    pub template: String,

    /// VM folder (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,

    /// Datastore (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,

    /// Resource pool (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,

    /// Number of virtual CPUs (template default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<u32>,

    /// Memory in MiB (template default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "memoryMiB")]
    pub memory_mib: Option<u64>,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkSpec,

    /// BIOS UUID of the backing VM; set once, never cleared
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "biosUUID")]
    pub bios_uuid: Option<String>,
}

/// Network configuration of a VM
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// One entry per NIC
    #[serde(default)]
    pub devices: Vec<NetworkDeviceSpec>,
}

/// A single NIC
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDeviceSpec {
    /// Port group / network name
    pub network_name: String,

    /// Use DHCPv4
    #[serde(default)]
    pub dhcp4: bool,

    /// Use DHCPv6
    #[serde(default)]
    pub dhcp6: bool,

    /// Static addresses in CIDR notation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,

    /// IPv4 gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway4: Option<String>,

    /// IPv6 gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway6: Option<String>,

    /// MAC address (generated when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_addr: Option<String>,

    /// DNS servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
}

impl NetworkDeviceSpec {
    /// A device needs a static address assigned before it can be configured
    pub fn is_waiting_for_static_ip(&self) -> bool {
        !self.dhcp4 && !self.dhcp6 && self.ip_addrs.is_empty()
    }
}

/// Observed state of a NIC
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Whether the NIC is connected
    #[serde(default)]
    pub connected: bool,

    /// Addresses reported by the guest
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,

    /// MAC address
    #[serde(default)]
    pub mac_addr: String,

    /// Network the NIC is attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereVMStatus {
    /// VM is provisioned and has addresses
    #[serde(default)]
    pub ready: bool,

    /// All guest addresses, flattened
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    /// Per-NIC status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<NetworkStatus>,

    /// Platform task currently acting on the VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<String>,

    /// Terminal failure reason; reconciliation stops while set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Terminal failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl VSphereVM {
    /// A terminal failure has been recorded
    pub fn has_failed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.failure_reason.is_some() || s.failure_message.is_some())
    }

    /// The VM must wait for a static IP on at least one device
    pub fn is_waiting_for_static_ip(&self) -> bool {
        self.spec
            .network
            .devices
            .iter()
            .any(NetworkDeviceSpec::is_waiting_for_static_ip)
    }
}

impl HasConditions for VSphereVM {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}
