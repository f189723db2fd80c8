//! vSphere Automation API data models
//!
//! Only the fields the controllers use are modelled; everything else in the
//! responses is ignored on deserialization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Username and password for vCenter
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username, e.g. `administrator@vsphere.local`
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create credentials from a username/password pair
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Information about the current API session (`GET /api/session`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    /// Authenticated user
    pub user: String,
    /// Session creation time
    #[serde(default)]
    pub created_time: Option<String>,
    /// Last time the session was used
    #[serde(default)]
    pub last_accessed_time: Option<String>,
}

/// Opaque reference to a managed object, e.g. `VirtualMachine:vm-42`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ManagedObjectReference {
    /// Managed object type
    #[serde(rename = "type")]
    pub type_: String,
    /// Managed object identifier
    pub value: String,
}

impl ManagedObjectReference {
    /// Reference to a virtual machine
    pub fn vm(value: impl Into<String>) -> Self {
        Self {
            type_: "VirtualMachine".to_string(),
            value: value.into(),
        }
    }

    /// Reference to a datacenter
    pub fn datacenter(value: impl Into<String>) -> Self {
        Self {
            type_: "Datacenter".to_string(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for ManagedObjectReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.type_, self.value)
    }
}

/// A resolved datacenter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datacenter {
    /// Inventory name
    pub name: String,
    /// Managed object reference
    pub reference: ManagedObjectReference,
}

/// Datacenter list entry (`GET /api/vcenter/datacenter`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatacenterSummary {
    /// Identifier, e.g. `datacenter-3`
    pub datacenter: String,
    /// Inventory name
    pub name: String,
}

/// VM list entry (`GET /api/vcenter/vm`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    /// Identifier, e.g. `vm-42`
    pub vm: String,
    /// Inventory name
    pub name: String,
    /// Power state
    #[serde(default)]
    pub power_state: Option<PowerState>,
}

/// VM power state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    /// Running
    PoweredOn,
    /// Stopped
    PoweredOff,
    /// Suspended
    Suspended,
}

/// Identity block of a VM
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct VmIdentity {
    /// Inventory name
    #[serde(default)]
    pub name: String,
    /// SMBIOS UUID
    #[serde(default)]
    pub bios_uuid: String,
    /// vCenter instance UUID
    #[serde(default)]
    pub instance_uuid: String,
}

/// Virtual NIC (`nics` map of `GET /api/vcenter/vm/{vm}`)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct VmNic {
    /// MAC address
    #[serde(default)]
    pub mac_address: String,
    /// Connection state, e.g. `CONNECTED`
    #[serde(default)]
    pub state: String,
    /// Backing network
    #[serde(default)]
    pub backing: Option<NicBacking>,
}

/// Network backing of a NIC
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct NicBacking {
    /// Network identifier
    #[serde(default)]
    pub network: Option<String>,
    /// Network name
    #[serde(default)]
    pub network_name: Option<String>,
}

/// VM details (`GET /api/vcenter/vm/{vm}`)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmInfo {
    /// Inventory name
    #[serde(default)]
    pub name: String,
    /// Power state
    #[serde(default)]
    pub power_state: Option<PowerState>,
    /// Identity block (vSphere 7.0 U1 and later)
    #[serde(default)]
    pub identity: Option<VmIdentity>,
    /// NICs keyed by device key
    #[serde(default)]
    pub nics: BTreeMap<String, VmNic>,
}

/// Guest-reported address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuestIpAddress {
    /// Address
    pub ip_address: String,
    /// Prefix length
    #[serde(default)]
    pub prefix_length: u8,
}

/// Guest IP configuration of an interface
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct GuestIpConfig {
    /// Addresses
    #[serde(default)]
    pub ip_addresses: Vec<GuestIpAddress>,
}

/// Guest-reported interface (`GET /api/vcenter/vm/{vm}/guest/networking/interfaces`)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct GuestInterface {
    /// MAC address
    #[serde(default)]
    pub mac_address: Option<String>,
    /// Device key of the backing NIC
    #[serde(default)]
    pub nic: Option<String>,
    /// IP configuration
    #[serde(default)]
    pub ip: Option<GuestIpConfig>,
}

/// Appliance version (`GET /api/appliance/system/version`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplianceVersion {
    /// Version, e.g. `7.0.3.01000`
    pub version: String,
    /// Build number
    #[serde(default)]
    pub build: String,
}

impl ApplianceVersion {
    /// Major version number, if parseable
    pub fn major(&self) -> Option<u32> {
        self.version.split('.').next()?.parse().ok()
    }
}

/// Parameters for cloning a VM from a template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneRequest {
    /// Name of the new VM
    pub name: String,
    /// Name of the source template
    pub template: String,
    /// Datacenter to place the VM in
    pub datacenter: Option<Datacenter>,
    /// Folder name
    pub folder: Option<String>,
    /// Datastore name
    pub datastore: Option<String>,
    /// Resource pool name
    pub resource_pool: Option<String>,
}
