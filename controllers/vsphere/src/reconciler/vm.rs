//! `VSphereVM` reconciliation
//!
//! Retrieves a platform session, resolves the owner chain, then drives the
//! VM through the lifecycle service. The resource is written back once at
//! the end of every pass with a recomputed `Ready` summary.

use super::{Context, REQUEUE_AFTER, patch_object};
use crate::error::ControllerError;
use crate::identity::vm_credentials;
use crate::reconcile_helpers::{add_finalizer, is_deleting, object_key, owner_name, remove_finalizer};
use crate::store::ResourceStore;
use crate::vmservice::{VmContext, VmState};
use crds::conditions::{self, ConditionSeverity};
use crds::{
    CLUSTER_NAME_LABEL, Cluster, DELETING_REASON, DELETION_FAILED_REASON, INFRASTRUCTURE_GROUP, Machine,
    VCENTER_AVAILABLE_CONDITION, VCENTER_UNREACHABLE_REASON, VM_FINALIZER, VM_PROVISIONED_CONDITION,
    VSphereMachine, VSphereVM, WAITING_FOR_STATIC_IP_ALLOCATION_REASON, has_paused_annotation, is_paused,
};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};
use vsphere_client::{Params, Session};

const CALLER: &str = "vm-reconciler";

/// Reconcile one `VSphereVM`
pub async fn reconcile<S: ResourceStore>(vm: &VSphereVM, ctx: &Context<S>) -> Result<Action, ControllerError> {
    let name = vm.name_any();
    let namespace = vm.namespace().ok_or(ControllerError::MissingObjectKey("namespace"))?;

    let Some(original) = ctx.store.get::<VSphereVM>(Some(&namespace), &name).await? else {
        debug!(namespace = %namespace, name = %name, "VSphereVM not found, won't reconcile");
        return Ok(Action::await_change());
    };
    let mut vm = original.clone();

    let session = match retrieve_session(ctx, &vm).await {
        Ok(session) => session,
        Err(e) => {
            conditions::mark_false(
                &mut vm,
                VCENTER_AVAILABLE_CONDITION,
                VCENTER_UNREACHABLE_REASON,
                ConditionSeverity::Error,
                e.to_string(),
            );
            return finish(ctx, &original, &mut vm, Err(e)).await;
        }
    };
    conditions::mark_true(&mut vm, VCENTER_AVAILABLE_CONDITION);

    let failure_domain = if owned_by_load_balancer(&vm) {
        None
    } else {
        let Some(machine) = owner_machine(ctx, &vm, &namespace).await? else {
            return Ok(Action::await_change());
        };
        machine.spec.failure_domain
    };

    let result = if paused_by_cluster(ctx, &vm, &namespace).await {
        debug!(vm = %object_key(&vm), "VSphereVM linked to a cluster that is paused");
        Ok(Action::await_change())
    } else if is_deleting(&vm) {
        reconcile_delete(ctx, &mut vm, &session).await
    } else {
        reconcile_normal(ctx, &mut vm, &session, failure_domain.as_deref()).await
    };

    finish(ctx, &original, &mut vm, result).await
}

/// Recompute `Ready` and write back; a failing patch becomes the error
/// unless the pass already failed
async fn finish<S: ResourceStore>(
    ctx: &Context<S>,
    original: &VSphereVM,
    vm: &mut VSphereVM,
    result: Result<Action, ControllerError>,
) -> Result<Action, ControllerError> {
    conditions::set_summary(vm, &[VM_PROVISIONED_CONDITION, VCENTER_AVAILABLE_CONDITION]);
    match patch_object(&ctx.store, original, &*vm).await {
        Ok(_) => result,
        Err(e) => {
            error!(vm = %object_key(&*vm), error = %e, "Patch failed");
            result.and(Err(e))
        }
    }
}

async fn retrieve_session<S: ResourceStore>(ctx: &Context<S>, vm: &VSphereVM) -> Result<Arc<Session>, ControllerError> {
    let credentials = vm_credentials(&ctx.store, vm, &ctx.config).await?;
    let params = Params::new(vm.spec.server.as_str())
        .with_datacenter(vm.spec.datacenter.as_str())
        .with_thumbprint(vm.spec.thumbprint.as_str())
        .with_credentials(credentials)
        .with_feature(ctx.config.feature)
        .with_caller(CALLER);
    Ok(ctx.sessions.get_or_create(&params).await?)
}

/// Load balancer VMs are placed without failure domains
fn owned_by_load_balancer(vm: &VSphereVM) -> bool {
    vm.owner_references().iter().any(|o| {
        o.kind.ends_with("LoadBalancer") && o.api_version.starts_with(INFRASTRUCTURE_GROUP)
    })
}

/// Owner `VSphereMachine` → its Cluster API `Machine`
async fn owner_machine<S: ResourceStore>(
    ctx: &Context<S>,
    vm: &VSphereVM,
    namespace: &str,
) -> Result<Option<Machine>, ControllerError> {
    let vsphere_machine = match owner_name(&vm.metadata, "VSphereMachine", INFRASTRUCTURE_GROUP) {
        Some(owner) => ctx.store.get::<VSphereMachine>(Some(namespace), owner).await?,
        None => None,
    };
    let Some(vsphere_machine) = vsphere_machine else {
        info!(vm = %object_key(&*vm), "Owner VSphereMachine not found, won't reconcile");
        return Ok(None);
    };

    let machine_group = Machine::group(&());
    let Some(owner) = owner_name(&vsphere_machine.metadata, "Machine", &machine_group) else {
        info!(machine = %vsphere_machine.name_any(), "Waiting for OwnerRef to be set on VSphereMachine");
        return Ok(None);
    };
    let machine = ctx.store.get::<Machine>(Some(namespace), owner).await?;
    if machine.is_none() {
        info!(machine = %owner, "Owner Machine not found, won't reconcile");
    }
    Ok(machine)
}

/// Paused through the labelled Cluster API cluster or the VM's own annotation
async fn paused_by_cluster<S: ResourceStore>(ctx: &Context<S>, vm: &VSphereVM, namespace: &str) -> bool {
    let cluster = match vm.labels().get(CLUSTER_NAME_LABEL) {
        Some(cluster_name) => match ctx.store.get::<Cluster>(Some(namespace), cluster_name).await {
            Ok(cluster) => cluster,
            Err(e) => {
                debug!(vm = %object_key(&*vm), error = %e, "Failed to get owner cluster");
                None
            }
        },
        None => None,
    };
    match cluster {
        Some(cluster) => is_paused(&cluster, &vm.metadata),
        None => false,
    }
}

async fn reconcile_delete<S: ResourceStore>(
    ctx: &Context<S>,
    vm: &mut VSphereVM,
    session: &Session,
) -> Result<Action, ControllerError> {
    info!(vm = %object_key(&*vm), "Handling deleted VSphereVM");
    conditions::mark_false(vm, VM_PROVISIONED_CONDITION, DELETING_REASON, ConditionSeverity::Info, "");

    let snapshot = vm.clone();
    let destroyed = async {
        let service = ctx.vm_services.service_for(session).await?;
        service
            .destroy_vm(VmContext {
                vm: &snapshot,
                session,
                failure_domain: None,
            })
            .await
    }
    .await;
    let observed = match destroyed {
        Ok(observed) => observed,
        Err(e) => {
            conditions::mark_false(
                vm,
                VM_PROVISIONED_CONDITION,
                DELETION_FAILED_REASON,
                ConditionSeverity::Warning,
                e.to_string(),
            );
            return Err(e);
        }
    };

    if observed.state != VmState::NotFound {
        info!(vm = %object_key(&*vm), actual = ?observed.state, "VM is not deleted yet");
        return Ok(Action::requeue(REQUEUE_AFTER));
    }

    remove_finalizer(vm, VM_FINALIZER);
    Ok(Action::await_change())
}

async fn reconcile_normal<S: ResourceStore>(
    ctx: &Context<S>,
    vm: &mut VSphereVM,
    session: &Session,
    failure_domain: Option<&str>,
) -> Result<Action, ControllerError> {
    if vm.has_failed() {
        info!(vm = %object_key(&*vm), "VM is failed, won't reconcile");
        return Ok(Action::await_change());
    }
    add_finalizer(vm, VM_FINALIZER);

    if vm.is_waiting_for_static_ip() {
        conditions::mark_false(
            vm,
            VM_PROVISIONED_CONDITION,
            WAITING_FOR_STATIC_IP_ALLOCATION_REASON,
            ConditionSeverity::Info,
            "",
        );
        info!(vm = %object_key(&*vm), "VM is waiting for a static IP to be available");
        return Ok(Action::await_change());
    }

    let service = ctx.vm_services.service_for(session).await?;
    let snapshot = vm.clone();
    let observed = service
        .reconcile_vm(VmContext {
            vm: &snapshot,
            session,
            failure_domain,
        })
        .await?;

    if observed.state != VmState::Ready {
        info!(vm = %object_key(&*vm), actual = ?observed.state, "VM is not ready yet");
        return Ok(Action::requeue(REQUEUE_AFTER));
    }

    if observed.bios_uuid.is_empty() {
        return Err(ControllerError::Reconciliation(format!(
            "BIOS UUID is empty while VM {} is ready",
            object_key(&*vm)
        )));
    }
    debug!(vm = %object_key(&*vm), bios_uuid = %observed.bios_uuid, "VM BIOS UUID");
    if vm.spec.bios_uuid.as_deref().is_none_or(str::is_empty) {
        vm.spec.bios_uuid = Some(observed.bios_uuid);
    }

    let status = vm.status.get_or_insert_with(Default::default);
    status.addresses = observed
        .network
        .iter()
        .flat_map(|n| n.ip_addrs.iter().cloned())
        .collect();
    status.network = observed.network;
    if status.addresses.is_empty() {
        return Ok(Action::requeue(REQUEUE_AFTER));
    }

    status.ready = true;
    conditions::mark_true(vm, VM_PROVISIONED_CONDITION);
    info!(vm = %object_key(&*vm), "VSphereVM is ready");
    Ok(Action::await_change())
}

/// Remembers each cluster's pause state between watch events
///
/// VMs are re-triggered when a cluster is first seen with the paused
/// annotation or when `spec.paused` flips from true to false.
#[derive(Debug, Default)]
pub struct PauseTracker {
    paused: Mutex<HashMap<ObjectRef<Cluster>, bool>>,
}

impl PauseTracker {
    /// Record `cluster` and report whether its VMs need a reconcile
    ///
    /// A cluster being deleted is forgotten.
    pub fn observe(&self, cluster: &Cluster) -> bool {
        let key = ObjectRef::from_obj(cluster);
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        if cluster.metadata.deletion_timestamp.is_some() {
            paused.remove(&key);
            return false;
        }
        let now_paused = cluster.spec.paused;
        let previous = paused.insert(key, now_paused);
        match previous {
            None => has_paused_annotation(&cluster.metadata),
            Some(was_paused) => was_paused && !now_paused,
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.paused.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// `VSphereVM`s labelled with `cluster`'s name in its namespace
pub fn cluster_to_vms<'a>(
    cluster: &Cluster,
    vms: impl IntoIterator<Item = &'a VSphereVM>,
) -> Vec<ObjectRef<VSphereVM>> {
    let name = cluster.name_any();
    let namespace = cluster.namespace();
    vms.into_iter()
        .filter(|vm| vm.namespace() == namespace)
        .filter(|vm| vm.labels().get(CLUSTER_NAME_LABEL) == Some(&name))
        .map(ObjectRef::from_obj)
        .collect()
}

#[cfg(test)]
#[path = "vm_test.rs"]
mod vm_test;
