//! VM lifecycle service
//!
//! Creates and destroys the VM behind a `VSphereVM` and reports what the
//! platform observes. The implementation is picked per vCenter by reading
//! the appliance version.

pub mod rest;

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{NetworkStatus, VSphereVM};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;
use vsphere_client::Session;

/// Lowest vCenter major version with the Automation REST VM API
pub const MIN_REST_MAJOR_VERSION: u32 = 7;

/// Observed lifecycle state of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmState {
    /// Powered on with guest networking reported
    Ready,
    /// Does not exist on the platform
    NotFound,
    /// Being created, powered on or deleted
    #[default]
    Pending,
    /// The platform reports an unrecoverable problem
    Error,
}

/// What the platform reports about a VM
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VirtualMachine {
    /// Inventory name
    pub name: String,
    /// Lifecycle state
    pub state: VmState,
    /// SMBIOS UUID; empty until known
    pub bios_uuid: String,
    /// Per-NIC network status
    pub network: Vec<NetworkStatus>,
}

/// Everything a lifecycle call needs
#[derive(Debug, Clone, Copy)]
pub struct VmContext<'a> {
    /// The VM resource
    pub vm: &'a VSphereVM,
    /// Session for the VM's vCenter
    pub session: &'a Session,
    /// Failure domain chosen by the owner Machine
    pub failure_domain: Option<&'a str>,
}

/// Creates and destroys VMs
#[async_trait]
pub trait VmService: Send + Sync {
    /// Drive the VM toward existence and report its state
    async fn reconcile_vm(&self, ctx: VmContext<'_>) -> Result<VirtualMachine, ControllerError>;

    /// Drive the VM toward deletion; `NotFound` once it is gone
    async fn destroy_vm(&self, ctx: VmContext<'_>) -> Result<VirtualMachine, ControllerError>;
}

/// Picks a `VmService` for a session
#[async_trait]
pub trait VmServiceProvider: Send + Sync {
    /// Lifecycle service for the session's vCenter
    async fn service_for(&self, session: &Session) -> Result<Arc<dyn VmService>, ControllerError>;
}

/// Capability detection by appliance version, cached per server
#[derive(Default)]
pub struct CapabilityDetector {
    services: Mutex<HashMap<String, Arc<dyn VmService>>>,
}

impl std::fmt::Debug for CapabilityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDetector").finish_non_exhaustive()
    }
}

#[async_trait]
impl VmServiceProvider for CapabilityDetector {
    async fn service_for(&self, session: &Session) -> Result<Arc<dyn VmService>, ControllerError> {
        let server = session.key().server.clone();
        let cached = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&server)
            .cloned();
        if let Some(service) = cached {
            return Ok(service);
        }

        let version = session.vim()?.version().await?;
        let service: Arc<dyn VmService> = match version.major() {
            Some(major) if major >= MIN_REST_MAJOR_VERSION => Arc::new(rest::RestVmService),
            _ => {
                return Err(ControllerError::Unsupported(format!(
                    "vCenter {} at {} is older than {}.0",
                    version.version, server, MIN_REST_MAJOR_VERSION
                )));
            }
        };
        info!(server = %server, version = %version.version, "Selected REST VM lifecycle service");

        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server, Arc::clone(&service));
        Ok(service)
    }
}
