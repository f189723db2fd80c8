//! In-memory platform for unit tests
//!
//! `MockConnector` implements `PlatformConnector` without a vCenter. It
//! counts logins, tracks which sessions are live, can expire idle sessions
//! and keeps a small VM inventory that clone/power/delete act on.

use crate::error::VSphereError;
use crate::models::*;
use crate::platform_trait::{PlatformConnector, TagClient, VimClient};
use reqwest::Url;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A VM in the mock inventory
#[derive(Debug, Clone)]
pub struct MockVm {
    /// Datacenter name the VM lives in
    pub datacenter: Option<String>,
    /// Details returned by `vm_info`
    pub info: VmInfo,
    /// Guest-reported interfaces
    pub guest: Vec<GuestInterface>,
}

#[derive(Debug, Default)]
struct MockState {
    logins: usize,
    tag_logins: usize,
    next_id: u64,
    sessions: HashMap<String, Instant>,
    tag_sessions: HashMap<String, Instant>,
    idle_timeout: Option<Duration>,
    reject_logins: bool,
    fail_logouts: bool,
    version: String,
    datacenters: BTreeMap<String, String>,
    vms: BTreeMap<String, MockVm>,
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Whether `token` is live, expiring it first if it idled out
    fn alive(&mut self, token: &str, tags: bool) -> bool {
        let timeout = self.idle_timeout;
        let sessions = if tags { &mut self.tag_sessions } else { &mut self.sessions };
        let Some(last_used) = sessions.get_mut(token) else {
            return false;
        };
        let now = Instant::now();
        if timeout.is_some_and(|t| now.duration_since(*last_used) > t) {
            sessions.remove(token);
            return false;
        }
        *last_used = now;
        true
    }
}

/// Mock platform connector
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Empty platform reporting version 8.0
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                version: "8.0.2.00100".to_string(),
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expire sessions that have been idle longer than `timeout`
    pub fn with_idle_timeout(self, timeout: Duration) -> Self {
        self.state().idle_timeout = Some(timeout);
        self
    }

    /// Report a different appliance version
    pub fn with_version(self, version: impl Into<String>) -> Self {
        self.state().version = version.into();
        self
    }

    /// Add a datacenter
    pub fn add_datacenter(&self, name: impl Into<String>) {
        let mut state = self.state();
        let id = format!("datacenter-{}", state.next_id());
        state.datacenters.insert(name.into(), id);
    }

    /// Add a VM (or template) and return its identifier
    pub fn add_vm(&self, datacenter: Option<&str>, info: VmInfo) -> String {
        let mut state = self.state();
        let id = format!("vm-{}", state.next_id());
        state.vms.insert(
            id.clone(),
            MockVm {
                datacenter: datacenter.map(str::to_string),
                info,
                guest: Vec::new(),
            },
        );
        id
    }

    /// Snapshot of a VM
    pub fn vm(&self, id: &str) -> Option<MockVm> {
        self.state().vms.get(id).cloned()
    }

    /// Snapshot of a VM looked up by name
    pub fn vm_by_name(&self, name: &str) -> Option<MockVm> {
        self.state().vms.values().find(|vm| vm.info.name == name).cloned()
    }

    /// Number of VMs, templates included
    pub fn vm_count(&self) -> usize {
        self.state().vms.len()
    }

    /// Successful inventory logins so far
    pub fn login_count(&self) -> usize {
        self.state().logins
    }

    /// Successful tagging logins so far
    pub fn tag_login_count(&self) -> usize {
        self.state().tag_logins
    }

    /// Inventory sessions that are currently live
    pub fn active_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    /// Tagging sessions that are currently live
    pub fn active_tag_sessions(&self) -> usize {
        self.state().tag_sessions.len()
    }

    /// Terminate every session out of band
    pub fn invalidate_all(&self) {
        let mut state = self.state();
        state.sessions.clear();
        state.tag_sessions.clear();
    }

    /// Make subsequent logins fail
    pub fn reject_logins(&self, reject: bool) {
        self.state().reject_logins = reject;
    }

    /// Make logouts end the session but report an error
    pub fn fail_logouts(&self, fail: bool) {
        self.state().fail_logouts = fail;
    }

    fn open(&self, credentials: &Credentials, tags: bool) -> Result<String, VSphereError> {
        let mut state = self.state();
        if state.reject_logins {
            return Err(VSphereError::Authentication(format!(
                "login as {} rejected",
                credentials.username
            )));
        }
        let token = format!("session-{}", state.next_id());
        let now = Instant::now();
        if tags {
            state.tag_logins += 1;
            state.tag_sessions.insert(token.clone(), now);
        } else {
            state.logins += 1;
            state.sessions.insert(token.clone(), now);
        }
        Ok(token)
    }
}

#[async_trait::async_trait]
impl PlatformConnector for MockConnector {
    async fn login(
        &self,
        _endpoint: &Url,
        credentials: &Credentials,
        _thumbprint: Option<&str>,
    ) -> Result<Arc<dyn VimClient>, VSphereError> {
        let token = self.open(credentials, false)?;
        Ok(Arc::new(MockVimClient {
            state: Arc::clone(&self.state),
            token,
        }))
    }

    async fn login_tags(
        &self,
        _endpoint: &Url,
        credentials: &Credentials,
        _thumbprint: Option<&str>,
    ) -> Result<Arc<dyn TagClient>, VSphereError> {
        let token = self.open(credentials, true)?;
        Ok(Arc::new(MockTagClient {
            state: Arc::clone(&self.state),
            token,
        }))
    }
}

/// Mock inventory client bound to one session token
#[derive(Debug)]
pub struct MockVimClient {
    state: Arc<Mutex<MockState>>,
    token: String,
}

impl MockVimClient {
    fn authenticated(&self) -> Result<MutexGuard<'_, MockState>, VSphereError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.alive(&self.token, false) {
            return Err(VSphereError::Authentication("session is not authenticated".to_string()));
        }
        Ok(state)
    }

    fn with_vm<T>(
        &self,
        vm: &ManagedObjectReference,
        f: impl FnOnce(&mut MockVm) -> T,
    ) -> Result<T, VSphereError> {
        let mut state = self.authenticated()?;
        state
            .vms
            .get_mut(&vm.value)
            .map(f)
            .ok_or_else(|| VSphereError::NotFound(vm.to_string()))
    }
}

fn in_datacenter(vm: &MockVm, datacenter: Option<&Datacenter>) -> bool {
    datacenter.is_none_or(|dc| vm.datacenter.as_deref() == Some(dc.name.as_str()))
}

#[async_trait::async_trait]
impl VimClient for MockVimClient {
    async fn session_info(&self) -> Result<Option<SessionInfo>, VSphereError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.alive(&self.token, false).then(|| SessionInfo {
            user: "mock".to_string(),
            created_time: None,
            last_accessed_time: None,
        }))
    }

    async fn logout(&self) -> Result<(), VSphereError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sessions.remove(&self.token);
        if state.fail_logouts {
            return Err(VSphereError::Api("logout failed".to_string()));
        }
        Ok(())
    }

    async fn version(&self) -> Result<ApplianceVersion, VSphereError> {
        let state = self.authenticated()?;
        Ok(ApplianceVersion {
            version: state.version.clone(),
            build: "0".to_string(),
        })
    }

    async fn find_datacenter(&self, name: &str) -> Result<Datacenter, VSphereError> {
        let state = self.authenticated()?;
        state
            .datacenters
            .get(name)
            .map(|id| Datacenter {
                name: name.to_string(),
                reference: ManagedObjectReference::datacenter(id.clone()),
            })
            .ok_or_else(|| VSphereError::NotFound(format!("datacenter {:?}", name)))
    }

    async fn find_by_uuid(
        &self,
        datacenter: Option<&Datacenter>,
        uuid: &str,
        instance_uuid: bool,
    ) -> Result<ManagedObjectReference, VSphereError> {
        let state = self.authenticated()?;
        state
            .vms
            .iter()
            .filter(|(_, vm)| in_datacenter(vm, datacenter))
            .find(|(_, vm)| {
                vm.info.identity.as_ref().is_some_and(|identity| {
                    let candidate = if instance_uuid {
                        &identity.instance_uuid
                    } else {
                        &identity.bios_uuid
                    };
                    candidate.eq_ignore_ascii_case(uuid)
                })
            })
            .map(|(id, _)| ManagedObjectReference::vm(id.clone()))
            .ok_or_else(|| VSphereError::NotFound(format!("vm with uuid {}", uuid)))
    }

    async fn find_vm_by_name(
        &self,
        datacenter: Option<&Datacenter>,
        name: &str,
    ) -> Result<Option<ManagedObjectReference>, VSphereError> {
        let state = self.authenticated()?;
        Ok(state
            .vms
            .iter()
            .find(|(_, vm)| vm.info.name == name && in_datacenter(vm, datacenter))
            .map(|(id, _)| ManagedObjectReference::vm(id.clone())))
    }

    async fn vm_info(&self, vm: &ManagedObjectReference) -> Result<VmInfo, VSphereError> {
        self.with_vm(vm, |vm| vm.info.clone())
    }

    async fn guest_interfaces(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<Vec<GuestInterface>, VSphereError> {
        self.with_vm(vm, |vm| vm.guest.clone())
    }

    async fn clone_vm(&self, request: &CloneRequest) -> Result<ManagedObjectReference, VSphereError> {
        let mut state = self.authenticated()?;
        let template = state
            .vms
            .values()
            .find(|vm| vm.info.name == request.template && in_datacenter(vm, request.datacenter.as_ref()))
            .cloned()
            .ok_or_else(|| VSphereError::NotFound(format!("template {:?}", request.template)))?;

        let n = state.next_id();
        let id = format!("vm-{}", n);
        let info = VmInfo {
            name: request.name.clone(),
            power_state: Some(PowerState::PoweredOff),
            identity: Some(VmIdentity {
                name: request.name.clone(),
                bios_uuid: format!("4215{:04x}-0000-0000-0000-000000000000", n),
                instance_uuid: format!("5015{:04x}-0000-0000-0000-000000000000", n),
            }),
            nics: template.info.nics,
        };
        state.vms.insert(
            id.clone(),
            MockVm {
                datacenter: request.datacenter.as_ref().map(|dc| dc.name.clone()),
                info,
                guest: Vec::new(),
            },
        );
        Ok(ManagedObjectReference::vm(id))
    }

    async fn power_on(&self, vm: &ManagedObjectReference) -> Result<(), VSphereError> {
        self.with_vm(vm, |vm| {
            vm.info.power_state = Some(PowerState::PoweredOn);
            // Guest tools report one address per NIC once the VM runs
            vm.guest = vm
                .info
                .nics
                .iter()
                .enumerate()
                .map(|(i, (key, nic))| GuestInterface {
                    mac_address: Some(nic.mac_address.clone()),
                    nic: Some(key.clone()),
                    ip: Some(GuestIpConfig {
                        ip_addresses: vec![GuestIpAddress {
                            ip_address: format!("10.0.0.{}", i + 10),
                            prefix_length: 24,
                        }],
                    }),
                })
                .collect();
        })
    }

    async fn power_off(&self, vm: &ManagedObjectReference) -> Result<(), VSphereError> {
        self.with_vm(vm, |vm| {
            vm.info.power_state = Some(PowerState::PoweredOff);
            vm.guest.clear();
        })
    }

    async fn delete_vm(&self, vm: &ManagedObjectReference) -> Result<(), VSphereError> {
        let mut state = self.authenticated()?;
        state
            .vms
            .remove(&vm.value)
            .map(|_| ())
            .ok_or_else(|| VSphereError::NotFound(vm.to_string()))
    }
}

/// Mock tagging client bound to one session token
#[derive(Debug)]
pub struct MockTagClient {
    state: Arc<Mutex<MockState>>,
    token: String,
}

#[async_trait::async_trait]
impl TagClient for MockTagClient {
    async fn session_info(&self) -> Result<Option<SessionInfo>, VSphereError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.alive(&self.token, true).then(|| SessionInfo {
            user: "mock".to_string(),
            created_time: None,
            last_accessed_time: None,
        }))
    }

    async fn logout(&self) -> Result<(), VSphereError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tag_sessions.remove(&self.token);
        if state.fail_logouts {
            return Err(VSphereError::Api("logout failed".to_string()));
        }
        Ok(())
    }
}
