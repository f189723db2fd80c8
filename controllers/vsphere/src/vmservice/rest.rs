//! Lifecycle service over the vSphere Automation REST API

use super::{VirtualMachine, VmContext, VmService, VmState};
use crate::error::ControllerError;
use async_trait::async_trait;
use crds::NetworkStatus;
use kube::ResourceExt;
use tracing::{debug, info};
use vsphere_client::{CloneRequest, GuestInterface, ManagedObjectReference, PowerState, VimClient, VmInfo};

/// Clone-from-template lifecycle for vCenter 7 and later
#[derive(Debug, Clone, Copy, Default)]
pub struct RestVmService;

impl RestVmService {
    /// Locate the VM by BIOS UUID when known, otherwise by name
    async fn find(&self, ctx: VmContext<'_>) -> Result<Option<ManagedObjectReference>, ControllerError> {
        if let Some(uuid) = ctx.vm.spec.bios_uuid.as_deref().filter(|u| !u.is_empty()) {
            match ctx.session.find_by_bios_uuid(uuid).await {
                Ok(vm) => return Ok(Some(vm)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        let vim = ctx.session.vim()?;
        Ok(vim.find_vm_by_name(ctx.session.datacenter(), &ctx.vm.name_any()).await?)
    }

    async fn clone_from_template(
        &self,
        vim: &dyn VimClient,
        ctx: VmContext<'_>,
    ) -> Result<ManagedObjectReference, ControllerError> {
        let spec = &ctx.vm.spec;
        let request = CloneRequest {
            name: ctx.vm.name_any(),
            template: spec.template.clone(),
            datacenter: ctx.session.datacenter().cloned(),
            folder: spec.folder.clone(),
            datastore: spec.datastore.clone(),
            resource_pool: spec.resource_pool.clone(),
        };
        info!(
            vm = %request.name,
            template = %request.template,
            failure_domain = ctx.failure_domain.unwrap_or_default(),
            "Cloning VM from template"
        );
        Ok(vim.clone_vm(&request).await?)
    }
}

/// Per-NIC status from the VM's devices and what the guest reports
fn network_status(info: &VmInfo, guest: &[GuestInterface]) -> Vec<NetworkStatus> {
    info.nics
        .iter()
        .map(|(key, nic)| {
            let reported = guest.iter().find(|g| {
                g.nic.as_deref() == Some(key.as_str())
                    || g.mac_address
                        .as_deref()
                        .is_some_and(|mac| mac.eq_ignore_ascii_case(&nic.mac_address))
            });
            NetworkStatus {
                connected: nic.state.eq_ignore_ascii_case("CONNECTED"),
                ip_addrs: reported
                    .and_then(|g| g.ip.as_ref())
                    .map(|ip| ip.ip_addresses.iter().map(|a| a.ip_address.clone()).collect())
                    .unwrap_or_default(),
                mac_addr: nic.mac_address.clone(),
                network_name: nic.backing.as_ref().and_then(|b| b.network_name.clone()),
            }
        })
        .collect()
}

#[async_trait]
impl VmService for RestVmService {
    async fn reconcile_vm(&self, ctx: VmContext<'_>) -> Result<VirtualMachine, ControllerError> {
        let vim = ctx.session.vim()?;
        let name = ctx.vm.name_any();

        let vm = match self.find(ctx).await? {
            Some(vm) => vm,
            None => {
                let vm = self.clone_from_template(vim.as_ref(), ctx).await?;
                vim.power_on(&vm).await?;
                return Ok(VirtualMachine {
                    name,
                    state: VmState::Pending,
                    ..Default::default()
                });
            }
        };

        let info = vim.vm_info(&vm).await?;
        let bios_uuid = info
            .identity
            .as_ref()
            .map(|i| i.bios_uuid.clone())
            .unwrap_or_default();

        if info.power_state != Some(PowerState::PoweredOn) {
            debug!(vm = %name, state = ?info.power_state, "Powering on VM");
            vim.power_on(&vm).await?;
            return Ok(VirtualMachine {
                name,
                state: VmState::Pending,
                bios_uuid,
                network: Vec::new(),
            });
        }

        let guest = vim.guest_interfaces(&vm).await?;
        let network = network_status(&info, &guest);
        let state = if network.iter().any(|n| !n.ip_addrs.is_empty()) {
            VmState::Ready
        } else {
            VmState::Pending
        };

        Ok(VirtualMachine {
            name,
            state,
            bios_uuid,
            network,
        })
    }

    async fn destroy_vm(&self, ctx: VmContext<'_>) -> Result<VirtualMachine, ControllerError> {
        let vim = ctx.session.vim()?;
        let name = ctx.vm.name_any();

        let Some(vm) = self.find(ctx).await? else {
            return Ok(VirtualMachine {
                name,
                state: VmState::NotFound,
                ..Default::default()
            });
        };

        let info = vim.vm_info(&vm).await?;
        if info.power_state == Some(PowerState::PoweredOn) {
            info!(vm = %name, "Powering off VM before deletion");
            vim.power_off(&vm).await?;
        }
        match vim.delete_vm(&vm).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        info!(vm = %name, "Deleted VM");

        Ok(VirtualMachine {
            name,
            state: VmState::NotFound,
            ..Default::default()
        })
    }
}
