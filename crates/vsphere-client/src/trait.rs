//! Platform client traits for mocking
//!
//! The session manager and the VM lifecycle service only talk to vCenter
//! through these traits. `RestConnector` is the production implementation;
//! `MockConnector` (feature `test-util`) keeps everything in memory.

use crate::error::VSphereError;
use crate::models::*;
use reqwest::Url;
use std::sync::Arc;

/// Creates authenticated platform sessions
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait PlatformConnector: Send + Sync {
    /// Log in and return an authenticated inventory client
    ///
    /// `thumbprint` pins the server certificate; `None` accepts any
    /// certificate.
    async fn login(
        &self,
        endpoint: &Url,
        credentials: &Credentials,
        thumbprint: Option<&str>,
    ) -> Result<Arc<dyn VimClient>, VSphereError>;

    /// Log in a second, independent session for the tagging API
    async fn login_tags(
        &self,
        endpoint: &Url,
        credentials: &Credentials,
        thumbprint: Option<&str>,
    ) -> Result<Arc<dyn TagClient>, VSphereError>;
}

/// Authenticated client for inventory and VM operations
#[async_trait::async_trait]
pub trait VimClient: Send + Sync + std::fmt::Debug {
    /// Minimal round trip; `None` when the session is no longer active
    async fn session_info(&self) -> Result<Option<SessionInfo>, VSphereError>;

    /// End the session
    async fn logout(&self) -> Result<(), VSphereError>;

    /// Appliance version, used for capability detection
    async fn version(&self) -> Result<ApplianceVersion, VSphereError>;

    /// Resolve a datacenter by inventory name
    async fn find_datacenter(&self, name: &str) -> Result<Datacenter, VSphereError>;

    /// Search the VM index by BIOS or instance UUID
    async fn find_by_uuid(
        &self,
        datacenter: Option<&Datacenter>,
        uuid: &str,
        instance_uuid: bool,
    ) -> Result<ManagedObjectReference, VSphereError>;

    /// Look up a VM (or template) by inventory name
    async fn find_vm_by_name(
        &self,
        datacenter: Option<&Datacenter>,
        name: &str,
    ) -> Result<Option<ManagedObjectReference>, VSphereError>;

    /// VM details
    async fn vm_info(&self, vm: &ManagedObjectReference) -> Result<VmInfo, VSphereError>;

    /// Guest-reported network interfaces (empty until tools report)
    async fn guest_interfaces(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<Vec<GuestInterface>, VSphereError>;

    /// Clone a template, returning the new VM
    async fn clone_vm(&self, request: &CloneRequest) -> Result<ManagedObjectReference, VSphereError>;

    /// Power a VM on
    async fn power_on(&self, vm: &ManagedObjectReference) -> Result<(), VSphereError>;

    /// Power a VM off
    async fn power_off(&self, vm: &ManagedObjectReference) -> Result<(), VSphereError>;

    /// Delete a powered-off VM
    async fn delete_vm(&self, vm: &ManagedObjectReference) -> Result<(), VSphereError>;
}

/// Authenticated client for the tagging API
#[async_trait::async_trait]
pub trait TagClient: Send + Sync + std::fmt::Debug {
    /// Current session; `None` when it is no longer active
    async fn session_info(&self) -> Result<Option<SessionInfo>, VSphereError>;

    /// End the session
    async fn logout(&self) -> Result<(), VSphereError>;
}
