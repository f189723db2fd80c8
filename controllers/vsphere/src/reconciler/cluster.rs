//! `VSphereCluster` reconciliation
//!
//! A normal pass adopts deployment zones as failure domains, claims the
//! identity secret, checks vCenter connectivity and then tracks the
//! workload cluster's API server. Deletion waits until every machine of the
//! cluster is gone before the finalizer is released.

use super::{Context, POLL_INTERVAL, REQUEUE_AFTER, patch_object};
use crate::error::ControllerError;
use crate::identity::cluster_credentials;
use crate::reconcile_helpers::{
    add_finalizer, is_deleting, object_key, owner_name, owner_reference, remove_finalizer,
};
use crate::store::ResourceStore;
use crds::conditions::{self, ConditionSeverity};
use crds::{
    CCM_AVAILABLE_CONDITION, CLUSTER_FINALIZER, CLUSTER_NAME_LABEL, CONTROL_PLANE_INITIALIZED_CONDITION,
    CSI_AVAILABLE_CONDITION, Cluster, DELETING_REASON, FAILURE_DOMAINS_AVAILABLE_CONDITION,
    FAILURE_DOMAINS_SKIPPED_REASON, FailureDomainSpec, SECRET_IDENTITY_FINALIZER, VCENTER_AVAILABLE_CONDITION,
    VCENTER_UNREACHABLE_REASON, VSphereCluster, VSphereDeploymentZone, VSphereMachine,
    WAITING_FOR_FAILURE_DOMAIN_STATUS_REASON, is_paused,
};
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use vsphere_client::Params;

const CALLER: &str = "cluster-reconciler";

/// Reconcile one `VSphereCluster`
pub async fn reconcile<S>(vsphere_cluster: &VSphereCluster, ctx: &Context<S>) -> Result<Action, ControllerError>
where
    S: ResourceStore + Clone,
{
    let name = vsphere_cluster.name_any();
    let namespace = vsphere_cluster
        .namespace()
        .ok_or(ControllerError::MissingObjectKey("namespace"))?;

    let Some(original) = ctx.store.get::<VSphereCluster>(Some(&namespace), &name).await? else {
        debug!(namespace = %namespace, name = %name, "VSphereCluster not found, won't reconcile");
        return Ok(Action::await_change());
    };

    let cluster_group = Cluster::group(&());
    let owner = match owner_name(&original.metadata, "Cluster", &cluster_group) {
        Some(owner) => ctx.store.get::<Cluster>(Some(&namespace), owner).await?,
        None => None,
    };
    let Some(cluster) = owner else {
        info!(cluster = %object_key(&original), "Waiting for Cluster Controller to set OwnerRef on VSphereCluster");
        return Ok(Action::await_change());
    };

    if is_paused(&cluster, &original.metadata) {
        info!(cluster = %object_key(&original), "VSphereCluster linked to a cluster that is paused");
        return Ok(Action::await_change());
    }

    let mut vsphere_cluster = original.clone();
    let result = if is_deleting(&vsphere_cluster) {
        reconcile_delete(ctx, &mut vsphere_cluster, &cluster).await
    } else {
        reconcile_normal(ctx, &mut vsphere_cluster, &cluster).await
    };

    conditions::set_summary(&mut vsphere_cluster, &[VCENTER_AVAILABLE_CONDITION]);
    match patch_object(&ctx.store, &original, &vsphere_cluster).await {
        Ok(_) => result,
        Err(e) => {
            error!(cluster = %object_key(&vsphere_cluster), error = %e, "Patch failed");
            result.and(Err(e))
        }
    }
}

async fn reconcile_delete<S: ResourceStore>(
    ctx: &Context<S>,
    vsphere_cluster: &mut VSphereCluster,
    cluster: &Cluster,
) -> Result<Action, ControllerError> {
    info!(cluster = %object_key(&*vsphere_cluster), "Reconciling VSphereCluster delete");
    for condition in [CCM_AVAILABLE_CONDITION, CSI_AVAILABLE_CONDITION] {
        conditions::mark_false(vsphere_cluster, condition, DELETING_REASON, ConditionSeverity::Info, "");
    }

    let selector = format!("{}={}", CLUSTER_NAME_LABEL, cluster.name_any());
    let machines = ctx
        .store
        .list::<VSphereMachine>(vsphere_cluster.namespace().as_deref(), Some(&selector))
        .await?;
    if !machines.is_empty() {
        info!(
            cluster = %object_key(&*vsphere_cluster),
            count = machines.len(),
            "Waiting for VSphereMachines to be deleted"
        );
        return Ok(Action::requeue(REQUEUE_AFTER));
    }

    if vsphere_cluster.has_secret_identity() {
        release_identity_secret(ctx, vsphere_cluster).await?;
    }

    remove_finalizer(vsphere_cluster, CLUSTER_FINALIZER);
    Ok(Action::await_change())
}

/// Drop the protective finalizer from the identity secret and delete it
async fn release_identity_secret<S: ResourceStore>(
    ctx: &Context<S>,
    vsphere_cluster: &VSphereCluster,
) -> Result<(), ControllerError> {
    let Some(identity) = &vsphere_cluster.spec.identity_ref else {
        return Ok(());
    };
    let namespace = vsphere_cluster.namespace();
    let Some(secret) = ctx.store.get::<Secret>(namespace.as_deref(), &identity.name).await? else {
        return Ok(());
    };

    let mut released = secret.clone();
    if remove_finalizer(&mut released, SECRET_IDENTITY_FINALIZER) {
        patch_object(&ctx.store, &secret, &released).await?;
    }
    info!(secret = %object_key(&secret), "Deleting identity secret");
    ctx.store.delete::<Secret>(namespace.as_deref(), &identity.name).await
}

async fn reconcile_normal<S>(
    ctx: &Context<S>,
    vsphere_cluster: &mut VSphereCluster,
    cluster: &Cluster,
) -> Result<Action, ControllerError>
where
    S: ResourceStore + Clone,
{
    add_finalizer(vsphere_cluster, CLUSTER_FINALIZER);

    let zones = ctx.store.list::<VSphereDeploymentZone>(None, None).await?;
    let domains = aggregate_failure_domains(vsphere_cluster, &zones);
    let has_domains = !domains.failure_domains.is_empty();
    vsphere_cluster
        .status
        .get_or_insert_with(Default::default)
        .failure_domains = domains.failure_domains;
    if domains.pending {
        info!(cluster = %object_key(&*vsphere_cluster), "Waiting for failure domains to be reconciled");
        conditions::mark_false(
            vsphere_cluster,
            FAILURE_DOMAINS_AVAILABLE_CONDITION,
            WAITING_FOR_FAILURE_DOMAIN_STATUS_REASON,
            ConditionSeverity::Info,
            "Waiting for failure domains to be reconciled",
        );
        return Ok(Action::requeue(REQUEUE_AFTER));
    }
    if has_domains {
        if domains.all_ready {
            conditions::mark_true(vsphere_cluster, FAILURE_DOMAINS_AVAILABLE_CONDITION);
        } else {
            conditions::mark_false(
                vsphere_cluster,
                FAILURE_DOMAINS_AVAILABLE_CONDITION,
                FAILURE_DOMAINS_SKIPPED_REASON,
                ConditionSeverity::Info,
                "One or more failure domains are not ready",
            );
        }
    }

    if let Err(e) = claim_identity_secret(ctx, vsphere_cluster).await {
        conditions::mark_false(
            vsphere_cluster,
            VCENTER_AVAILABLE_CONDITION,
            VCENTER_UNREACHABLE_REASON,
            ConditionSeverity::Error,
            e.to_string(),
        );
        return Err(e);
    }

    if let Err(e) = probe_vcenter(ctx, vsphere_cluster).await {
        conditions::mark_false(
            vsphere_cluster,
            VCENTER_AVAILABLE_CONDITION,
            VCENTER_UNREACHABLE_REASON,
            ConditionSeverity::Error,
            e.to_string(),
        );
        return Err(e);
    }
    conditions::mark_true(vsphere_cluster, VCENTER_AVAILABLE_CONDITION);
    vsphere_cluster.status.get_or_insert_with(Default::default).ready = true;
    debug!(cluster = %object_key(&*vsphere_cluster), "Reconciled VSphereCluster infrastructure");

    // The poller outlives the pass; its completion is of no interest here.
    drop(arm_api_server_poller(ctx, cluster, vsphere_cluster));

    if vsphere_cluster.spec.control_plane_endpoint.is_zero() {
        return Ok(Action::await_change());
    }

    if is_deleting(cluster) {
        for condition in [CCM_AVAILABLE_CONDITION, CSI_AVAILABLE_CONDITION] {
            conditions::mark_false(vsphere_cluster, condition, DELETING_REASON, ConditionSeverity::Info, "");
        }
        return Ok(Action::await_change());
    }

    let namespace = vsphere_cluster.namespace().unwrap_or_default();
    if ctx.probe.is_online(&namespace, &cluster.name_any()).await {
        conditions::mark_true(vsphere_cluster, CSI_AVAILABLE_CONDITION);
    }
    Ok(Action::await_change())
}

/// Outcome of matching deployment zones against a cluster
#[derive(Debug, Default, PartialEq)]
pub struct FailureDomains {
    /// Zones exposed as failure domains
    pub failure_domains: BTreeMap<String, FailureDomainSpec>,
    /// Some matched zone has not reported readiness yet
    pub pending: bool,
    /// Every matched zone reported ready
    pub all_ready: bool,
}

/// Match deployment zones to `vsphere_cluster`
///
/// A zone matches when it lives on the cluster's server and is named in the
/// adoption annotation. Zones reported not ready are left out of the map.
pub fn aggregate_failure_domains(vsphere_cluster: &VSphereCluster, zones: &[VSphereDeploymentZone]) -> FailureDomains {
    let adopted = vsphere_cluster.adopted_zones().unwrap_or_default();
    let mut result = FailureDomains {
        all_ready: true,
        ..Default::default()
    };

    for zone in zones {
        let zone_name = zone.name_any();
        if zone.spec.server != vsphere_cluster.spec.server || !adopted.contains(&zone_name.as_str()) {
            continue;
        }
        match zone.ready() {
            None => result.pending = true,
            Some(false) => {
                result.all_ready = false;
                continue;
            }
            Some(true) => {}
        }
        result.failure_domains.insert(
            zone_name,
            FailureDomainSpec {
                control_plane: zone.control_plane(),
            },
        );
    }
    result
}

/// Take ownership of the identity secret and protect it with a finalizer
async fn claim_identity_secret<S: ResourceStore>(
    ctx: &Context<S>,
    vsphere_cluster: &VSphereCluster,
) -> Result<(), ControllerError> {
    if !vsphere_cluster.has_secret_identity() {
        return Ok(());
    }
    let Some(identity) = &vsphere_cluster.spec.identity_ref else {
        return Ok(());
    };
    let namespace = vsphere_cluster.namespace();
    let secret = ctx
        .store
        .get::<Secret>(namespace.as_deref(), &identity.name)
        .await?
        .ok_or_else(|| {
            ControllerError::Credentials(format!(
                "secret {}/{} not found",
                namespace.as_deref().unwrap_or_default(),
                identity.name
            ))
        })?;

    let uid = vsphere_cluster.uid();
    let owners = secret.owner_references();
    if !owners.is_empty() && !owners.iter().any(|o| Some(&o.uid) == uid.as_ref()) {
        return Err(ControllerError::OwnershipConflict(format!(
            "another cluster has set the OwnerRef for secret {}",
            object_key(&secret)
        )));
    }

    let mut claimed = secret.clone();
    if owners.is_empty() {
        let owner = owner_reference(vsphere_cluster).ok_or(ControllerError::MissingObjectKey("uid"))?;
        claimed.owner_references_mut().push(owner);
    }
    add_finalizer(&mut claimed, SECRET_IDENTITY_FINALIZER);
    patch_object(&ctx.store, &secret, &claimed).await?;
    Ok(())
}

/// Establish a fresh session to prove vCenter is reachable
async fn probe_vcenter<S: ResourceStore>(ctx: &Context<S>, vsphere_cluster: &VSphereCluster) -> Result<(), ControllerError> {
    let credentials = cluster_credentials(&ctx.store, vsphere_cluster, &ctx.config).await?;
    let mut params = Params::new(vsphere_cluster.spec.server.as_str())
        .with_thumbprint(vsphere_cluster.spec.thumbprint.as_str())
        .with_credentials(credentials)
        .with_feature(ctx.config.feature)
        .with_refresh(true)
        .with_caller(CALLER);
    if let Some(datacenter) = &vsphere_cluster.spec.datacenter {
        params = params.with_datacenter(datacenter.as_str());
    }
    ctx.sessions.get_or_create(&params).await?;
    Ok(())
}

/// Spawn the workload API server poller for `cluster`
///
/// Phase one waits for the API server to answer and then re-triggers the
/// `VSphereCluster`; phase two waits for `ControlPlaneInitialized` so no
/// second poller starts in between. Returns `None` when no poller was
/// started, either because one is running or none is needed.
pub(crate) fn arm_api_server_poller<S>(
    ctx: &Context<S>,
    cluster: &Cluster,
    vsphere_cluster: &VSphereCluster,
) -> Option<oneshot::Receiver<()>>
where
    S: ResourceStore + Clone,
{
    if conditions::is_true(cluster, CONTROL_PLANE_INITIALIZED_CONDITION) {
        return None;
    }
    let uid = cluster.uid()?;
    if ctx.triggers.contains(&uid) {
        debug!(cluster = %object_key(cluster), "API server poller already running");
        return None;
    }

    let store = ctx.store.clone();
    let probe = Arc::clone(&ctx.probe);
    let trigger = ctx.cluster_trigger.clone();
    let target = ObjectRef::from_obj(vsphere_cluster);
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    ctx.triggers.spawn_once(&uid, async move {
        info!(namespace = %namespace, cluster = %name, "Waiting for workload API server to come online");
        while !probe.is_online(&namespace, &name).await {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        info!(namespace = %namespace, cluster = %name, "Workload API server is online");
        if trigger.unbounded_send(target).is_err() {
            warn!(cluster = %name, "Cluster controller is gone, dropping re-trigger");
        }

        loop {
            match store.get::<Cluster>(Some(&namespace), &name).await {
                Ok(None) => break,
                Ok(Some(current)) if conditions::is_true(&current, CONTROL_PLANE_INITIALIZED_CONDITION) => break,
                Ok(Some(_)) => {}
                Err(e) => warn!(cluster = %name, error = %e, "Failed to get Cluster"),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        debug!(namespace = %namespace, cluster = %name, "Control plane initialized, poller done");
    })
}

/// `VSphereMachine` event → its `VSphereCluster`, while a control plane
/// endpoint is still being discovered
pub fn control_plane_machine_to_cluster(
    machine: &VSphereMachine,
    find_cluster: impl Fn(&ObjectRef<Cluster>) -> Option<Arc<Cluster>>,
    find_vsphere_cluster: impl Fn(&ObjectRef<VSphereCluster>) -> Option<Arc<VSphereCluster>>,
) -> Option<ObjectRef<VSphereCluster>> {
    if !machine.is_control_plane() {
        return None;
    }
    machine.preferred_ip_address()?;
    let namespace = machine.namespace()?;
    let cluster_name = machine.cluster_name()?;
    let cluster = find_cluster(&ObjectRef::new(cluster_name).within(&namespace))?;

    if conditions::is_true(&*cluster, CONTROL_PLANE_INITIALIZED_CONDITION) {
        return None;
    }
    if !cluster.spec.control_plane_endpoint.is_zero() {
        return None;
    }

    let target = cluster_to_infrastructure(&cluster)?;
    let vsphere_cluster = find_vsphere_cluster(&target)?;
    if !vsphere_cluster.spec.control_plane_endpoint.is_zero() {
        return None;
    }
    Some(target)
}

/// `VSphereDeploymentZone` event → every `VSphereCluster` on the same server
pub fn deployment_zone_to_clusters<'a>(
    zone: &VSphereDeploymentZone,
    clusters: impl IntoIterator<Item = &'a VSphereCluster>,
) -> Vec<ObjectRef<VSphereCluster>> {
    clusters
        .into_iter()
        .filter(|c| c.spec.server == zone.spec.server)
        .map(ObjectRef::from_obj)
        .collect()
}

/// Cluster API `Cluster` → the `VSphereCluster` it references
pub fn cluster_to_infrastructure(cluster: &Cluster) -> Option<ObjectRef<VSphereCluster>> {
    let infra = cluster.spec.infrastructure_ref.as_ref()?;
    if infra.kind != VSphereCluster::kind(&()) {
        return None;
    }
    let namespace = infra.namespace.clone().or_else(|| cluster.namespace())?;
    Some(ObjectRef::new(&infra.name).within(&namespace))
}

#[cfg(test)]
#[path = "cluster_test.rs"]
mod cluster_test;
