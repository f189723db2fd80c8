use super::*;
use crate::test_utils::*;
use crds::conditions::ConditionStatus;
use crds::{
    ADOPT_DEPLOYMENT_ZONE_ANNOTATION, ApiEndpoint, CONTROL_PLANE_LABEL, IdentityKind, IdentityReference,
    MachineAddress, MachineAddressType, VSphereDeploymentZoneSpec, VSphereDeploymentZoneStatus,
    VSphereMachineSpec, VSphereMachineStatus,
};
use futures::StreamExt;
use std::collections::BTreeMap;

const CLUSTER: &str = "workload";

/// Cluster API cluster plus its owned `VSphereCluster`, both stored
fn install_cluster(h: &Harness) -> VSphereCluster {
    let capi = test_capi_cluster("ns", CLUSTER);
    let mut vsphere_cluster = test_vsphere_cluster("ns", CLUSTER, TEST_SERVER);
    vsphere_cluster.metadata.owner_references = Some(vec![owner_ref(&capi)]);
    h.store.insert(capi);
    h.store.insert(vsphere_cluster);
    stored(h)
}

fn stored(h: &Harness) -> VSphereCluster {
    h.store
        .get_object(Some("ns"), CLUSTER)
        .expect("VSphereCluster should exist")
}

fn update(h: &Harness, f: impl FnOnce(&mut VSphereCluster)) -> VSphereCluster {
    let mut vsphere_cluster = stored(h);
    f(&mut vsphere_cluster);
    h.store.insert(vsphere_cluster);
    stored(h)
}

fn condition(vsphere_cluster: &VSphereCluster, type_: &str) -> Option<(ConditionStatus, Option<String>)> {
    conditions::get(vsphere_cluster, type_).map(|c| (c.status, c.reason.clone()))
}

fn zone(name: &str, server: &str, ready: Option<bool>) -> VSphereDeploymentZone {
    let mut zone = VSphereDeploymentZone::new(
        name,
        VSphereDeploymentZoneSpec {
            server: server.to_string(),
            failure_domain: name.to_string(),
            control_plane: None,
        },
    );
    zone.status = Some(VSphereDeploymentZoneStatus { ready });
    zone
}

fn adopting(zones: &str) -> impl FnOnce(&mut VSphereCluster) {
    let zones = zones.to_string();
    move |c| {
        c.metadata.annotations = Some(BTreeMap::from([(ADOPT_DEPLOYMENT_ZONE_ANNOTATION.to_string(), zones)]));
    }
}

fn machine(name: &str) -> VSphereMachine {
    let mut machine = VSphereMachine::new(name, VSphereMachineSpec::default());
    machine.metadata.namespace = Some("ns".to_string());
    machine.metadata.labels = Some(BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), CLUSTER.to_string())]));
    machine
}

fn with_secret_identity(h: &Harness) -> VSphereCluster {
    h.store.insert(test_secret("ns", "creds", "alice", "pw"));
    update(h, |c| {
        c.spec.identity_ref = Some(IdentityReference {
            kind: IdentityKind::Secret,
            name: "creds".to_string(),
        });
    })
}

#[tokio::test]
async fn test_normal_marks_ready() {
    let h = Harness::new();
    let vsphere_cluster = install_cluster(&h);

    reconcile(&vsphere_cluster, &*h.ctx).await.unwrap();

    let vsphere_cluster = stored(&h);
    assert!(vsphere_cluster.status.clone().unwrap().ready);
    assert_eq!(vsphere_cluster.metadata.finalizers, Some(vec![CLUSTER_FINALIZER.to_string()]));
    assert!(conditions::is_true(&vsphere_cluster, VCENTER_AVAILABLE_CONDITION));
    assert!(conditions::is_true(&vsphere_cluster, crds::READY_CONDITION));
    // No zones adopted
    assert!(conditions::get(&vsphere_cluster, FAILURE_DOMAINS_AVAILABLE_CONDITION).is_none());
}

#[tokio::test]
async fn test_missing_owner_is_a_no_op() {
    let h = Harness::new();
    h.store.insert(test_vsphere_cluster("ns", CLUSTER, TEST_SERVER));
    let vsphere_cluster = stored(&h);

    assert_eq!(reconcile(&vsphere_cluster, &*h.ctx).await.unwrap(), Action::await_change());
    assert_eq!(h.store.patch_count(), 0);
}

#[tokio::test]
async fn test_paused_cluster_is_a_no_op() {
    let h = Harness::new();
    let vsphere_cluster = install_cluster(&h);
    let mut capi: Cluster = h.store.get_object(Some("ns"), CLUSTER).unwrap();
    capi.spec.paused = true;
    h.store.insert(capi);

    reconcile(&vsphere_cluster, &*h.ctx).await.unwrap();
    assert_eq!(h.store.patch_count(), 0);
    assert_eq!(h.connector.login_count(), 0);
}

#[test]
fn test_aggregate_failure_domains() {
    let mut vsphere_cluster = test_vsphere_cluster("ns", CLUSTER, "s1");
    adopting("A:B")(&mut vsphere_cluster);
    let zones = [zone("A", "s1", Some(true)), zone("B", "s1", Some(false)), zone("C", "s2", Some(true))];

    let domains = aggregate_failure_domains(&vsphere_cluster, &zones);
    assert_eq!(domains.failure_domains.keys().collect::<Vec<_>>(), vec!["A"]);
    assert!(!domains.all_ready);
    assert!(!domains.pending);
}

#[test]
fn test_aggregate_failure_domains_without_annotation() {
    let vsphere_cluster = test_vsphere_cluster("ns", CLUSTER, "s1");
    let domains = aggregate_failure_domains(&vsphere_cluster, &[zone("A", "s1", Some(true))]);
    assert!(domains.failure_domains.is_empty());
}

#[tokio::test]
async fn test_not_ready_zone_skips_failure_domains() {
    let h = Harness::new();
    install_cluster(&h);
    let vsphere_cluster = update(&h, adopting("A:B"));
    h.store.insert(zone("A", TEST_SERVER, Some(true)));
    h.store.insert(zone("B", TEST_SERVER, Some(false)));
    h.store.insert(zone("C", "other.local", Some(true)));

    reconcile(&vsphere_cluster, &*h.ctx).await.unwrap();

    let vsphere_cluster = stored(&h);
    let status = vsphere_cluster.status.clone().unwrap();
    assert_eq!(status.failure_domains.keys().collect::<Vec<_>>(), vec!["A"]);
    assert!(status.failure_domains["A"].control_plane);
    assert_eq!(
        condition(&vsphere_cluster, FAILURE_DOMAINS_AVAILABLE_CONDITION),
        Some((ConditionStatus::False, Some(FAILURE_DOMAINS_SKIPPED_REASON.to_string())))
    );
    assert!(status.ready);
}

#[tokio::test]
async fn test_unreported_zone_waits() {
    let h = Harness::new();
    install_cluster(&h);
    let vsphere_cluster = update(&h, adopting("A"));
    h.store.insert(zone("A", TEST_SERVER, None));

    assert_eq!(
        reconcile(&vsphere_cluster, &*h.ctx).await.unwrap(),
        Action::requeue(REQUEUE_AFTER)
    );
    let vsphere_cluster = stored(&h);
    assert_eq!(
        condition(&vsphere_cluster, FAILURE_DOMAINS_AVAILABLE_CONDITION),
        Some((
            ConditionStatus::False,
            Some(WAITING_FOR_FAILURE_DOMAIN_STATUS_REASON.to_string())
        ))
    );
    let status = vsphere_cluster.status.unwrap();
    assert!(!status.ready);
    assert!(status.failure_domains.contains_key("A"));
    assert_eq!(h.connector.login_count(), 0);
}

#[tokio::test]
async fn test_identity_secret_is_claimed() {
    let h = Harness::new();
    install_cluster(&h);
    let vsphere_cluster = with_secret_identity(&h);

    reconcile(&vsphere_cluster, &*h.ctx).await.unwrap();

    let secret: Secret = h.store.get_object(Some("ns"), "creds").unwrap();
    let owners = secret.owner_references();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "VSphereCluster");
    assert_eq!(Some(&owners[0].uid), vsphere_cluster.uid().as_ref());
    assert_eq!(secret.metadata.finalizers, Some(vec![SECRET_IDENTITY_FINALIZER.to_string()]));
    assert!(conditions::is_true(&stored(&h), VCENTER_AVAILABLE_CONDITION));
}

#[tokio::test]
async fn test_identity_secret_owned_elsewhere_conflicts() {
    let h = Harness::new();
    install_cluster(&h);
    let vsphere_cluster = with_secret_identity(&h);
    let mut secret: Secret = h.store.get_object(Some("ns"), "creds").unwrap();
    let other = test_vsphere_cluster("ns", "other", TEST_SERVER);
    let mut owner = owner_ref(&other);
    owner.uid = "other-uid".to_string();
    secret.metadata.owner_references = Some(vec![owner]);
    h.store.insert(secret);

    let err = reconcile(&vsphere_cluster, &*h.ctx).await.unwrap_err();
    assert!(matches!(err, ControllerError::OwnershipConflict(_)));
    assert_eq!(
        condition(&stored(&h), VCENTER_AVAILABLE_CONDITION).map(|(status, _)| status),
        Some(ConditionStatus::False)
    );
}

#[tokio::test]
async fn test_unreachable_vcenter_fails_pass() {
    let h = Harness::new();
    h.connector.reject_logins(true);
    let vsphere_cluster = install_cluster(&h);

    assert!(reconcile(&vsphere_cluster, &*h.ctx).await.is_err());
    let vsphere_cluster = stored(&h);
    assert_eq!(
        condition(&vsphere_cluster, VCENTER_AVAILABLE_CONDITION),
        Some((ConditionStatus::False, Some(VCENTER_UNREACHABLE_REASON.to_string())))
    );
    assert!(!vsphere_cluster.status.unwrap().ready);
}

#[tokio::test]
async fn test_online_api_server_marks_csi_available() {
    let h = Harness::new();
    h.probe.set_online(true);
    install_cluster(&h);
    let vsphere_cluster = update(&h, |c| {
        c.spec.control_plane_endpoint = ApiEndpoint {
            host: "10.0.0.100".to_string(),
            port: 6443,
        };
    });

    reconcile(&vsphere_cluster, &*h.ctx).await.unwrap();
    assert!(conditions::is_true(&stored(&h), CSI_AVAILABLE_CONDITION));
}

async fn deleting_cluster(h: &Harness) -> VSphereCluster {
    install_cluster(h);
    update(h, |c| c.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]));
    h.store
        .delete::<VSphereCluster>(Some("ns"), CLUSTER)
        .await
        .unwrap();
    stored(h)
}

#[tokio::test]
async fn test_delete_waits_for_machines() {
    let h = Harness::new();
    let vsphere_cluster = deleting_cluster(&h).await;
    h.store.insert(machine("m-0"));
    h.store.insert(machine("m-1"));

    assert_eq!(
        reconcile(&vsphere_cluster, &*h.ctx).await.unwrap(),
        Action::requeue(REQUEUE_AFTER)
    );
    let current = stored(&h);
    assert_eq!(current.metadata.finalizers, Some(vec![CLUSTER_FINALIZER.to_string()]));
    assert_eq!(
        condition(&current, CCM_AVAILABLE_CONDITION),
        Some((ConditionStatus::False, Some(DELETING_REASON.to_string())))
    );

    h.store.remove::<VSphereMachine>(Some("ns"), "m-0");
    h.store.remove::<VSphereMachine>(Some("ns"), "m-1");
    reconcile(&vsphere_cluster, &*h.ctx).await.unwrap();
    assert!(!h.store.contains::<VSphereCluster>(Some("ns"), CLUSTER));
}

#[tokio::test]
async fn test_delete_releases_identity_secret() {
    let h = Harness::new();
    install_cluster(&h);
    let vsphere_cluster = with_secret_identity(&h);
    reconcile(&vsphere_cluster, &*h.ctx).await.unwrap();
    assert!(h.store.contains::<Secret>(Some("ns"), "creds"));

    h.store
        .delete::<VSphereCluster>(Some("ns"), CLUSTER)
        .await
        .unwrap();
    reconcile(&stored(&h), &*h.ctx).await.unwrap();

    assert!(!h.store.contains::<Secret>(Some("ns"), "creds"));
    assert!(!h.store.contains::<VSphereCluster>(Some("ns"), CLUSTER));
}

#[tokio::test(start_paused = true)]
async fn test_api_server_poller_retriggers_once() {
    let mut h = Harness::new();
    let vsphere_cluster = install_cluster(&h);
    let capi: Cluster = h.store.get_object(Some("ns"), CLUSTER).unwrap();

    let done = arm_api_server_poller(&*h.ctx, &capi, &vsphere_cluster).unwrap();
    assert!(arm_api_server_poller(&*h.ctx, &capi, &vsphere_cluster).is_none());

    tokio::time::sleep(POLL_INTERVAL * 3).await;
    assert!(h.probe.calls() >= 3);
    h.probe.set_online(true);

    let retrigger = h.retriggers.next().await.unwrap();
    assert_eq!(retrigger, ObjectRef::from_obj(&vsphere_cluster));
    assert!(h.ctx.triggers.contains("workload-uid"));

    let mut capi: Cluster = h.store.get_object(Some("ns"), CLUSTER).unwrap();
    conditions::mark_true(&mut capi, CONTROL_PLANE_INITIALIZED_CONDITION);
    h.store.insert(capi.clone());

    done.await.unwrap();
    assert!(!h.ctx.triggers.contains("workload-uid"));
    assert!(arm_api_server_poller(&*h.ctx, &capi, &vsphere_cluster).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_api_server_poller_stops_when_cluster_is_gone() {
    let h = Harness::new();
    h.probe.set_online(true);
    let vsphere_cluster = install_cluster(&h);
    let capi: Cluster = h.store.get_object(Some("ns"), CLUSTER).unwrap();
    h.store.remove::<Cluster>(Some("ns"), CLUSTER);

    let done = arm_api_server_poller(&*h.ctx, &capi, &vsphere_cluster).unwrap();
    done.await.unwrap();
    assert!(!h.ctx.triggers.contains("workload-uid"));
}

fn control_plane_machine(addresses: bool) -> VSphereMachine {
    let mut m = machine("cp-0");
    m.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(CONTROL_PLANE_LABEL.to_string(), String::new());
    if addresses {
        m.status = Some(VSphereMachineStatus {
            ready: true,
            addresses: vec![MachineAddress {
                type_: MachineAddressType::ExternalIP,
                address: "10.0.0.10".to_string(),
            }],
        });
    }
    m
}

#[test]
fn test_control_plane_machine_maps_to_cluster() {
    let capi = Arc::new(test_capi_cluster("ns", CLUSTER));
    let vsphere_cluster = Arc::new(test_vsphere_cluster("ns", CLUSTER, TEST_SERVER));
    let find_cluster = |_: &ObjectRef<Cluster>| Some(Arc::clone(&capi));
    let find_vsphere_cluster = |_: &ObjectRef<VSphereCluster>| Some(Arc::clone(&vsphere_cluster));

    assert_eq!(
        control_plane_machine_to_cluster(&control_plane_machine(true), find_cluster, find_vsphere_cluster),
        Some(ObjectRef::new(CLUSTER).within("ns"))
    );
    assert_eq!(
        control_plane_machine_to_cluster(&control_plane_machine(false), find_cluster, find_vsphere_cluster),
        None
    );
    let mut worker = control_plane_machine(true);
    worker.metadata.labels = machine("w-0").metadata.labels;
    assert_eq!(
        control_plane_machine_to_cluster(&worker, find_cluster, find_vsphere_cluster),
        None
    );
}

#[test]
fn test_control_plane_machine_without_ip_is_ignored() {
    let capi = Arc::new(test_capi_cluster("ns", CLUSTER));
    let vsphere_cluster = Arc::new(test_vsphere_cluster("ns", CLUSTER, TEST_SERVER));
    let mut machine = control_plane_machine(true);
    machine.status = Some(VSphereMachineStatus {
        ready: true,
        addresses: vec![MachineAddress {
            type_: MachineAddressType::InternalDNS,
            address: "cp-0.local".to_string(),
        }],
    });

    assert_eq!(
        control_plane_machine_to_cluster(
            &machine,
            |_| Some(Arc::clone(&capi)),
            |_| Some(Arc::clone(&vsphere_cluster)),
        ),
        None
    );
}

#[test]
fn test_control_plane_machine_ignored_once_endpoint_known() {
    let mut initialized = test_capi_cluster("ns", CLUSTER);
    conditions::mark_true(&mut initialized, CONTROL_PLANE_INITIALIZED_CONDITION);
    let initialized = Arc::new(initialized);
    let mut with_endpoint = test_vsphere_cluster("ns", CLUSTER, TEST_SERVER);
    with_endpoint.spec.control_plane_endpoint.host = "10.0.0.100".to_string();
    let with_endpoint = Arc::new(with_endpoint);
    let capi = Arc::new(test_capi_cluster("ns", CLUSTER));
    let machine = control_plane_machine(true);

    assert_eq!(
        control_plane_machine_to_cluster(
            &machine,
            |_| Some(Arc::clone(&initialized)),
            |_| Some(Arc::new(test_vsphere_cluster("ns", CLUSTER, TEST_SERVER))),
        ),
        None
    );
    assert_eq!(
        control_plane_machine_to_cluster(&machine, |_| Some(Arc::clone(&capi)), |_| Some(Arc::clone(&with_endpoint))),
        None
    );
    assert_eq!(control_plane_machine_to_cluster(&machine, |_| None, |_| None), None);
}

#[test]
fn test_deployment_zone_maps_to_clusters_on_server() {
    let on_server = test_vsphere_cluster("ns", "a", "s1");
    let elsewhere = test_vsphere_cluster("ns", "b", "s2");
    let zone = zone("A", "s1", Some(true));

    assert_eq!(
        deployment_zone_to_clusters(&zone, [&on_server, &elsewhere]),
        vec![ObjectRef::from_obj(&on_server)]
    );
}

#[test]
fn test_cluster_to_infrastructure() {
    let cluster = test_capi_cluster("ns", CLUSTER);
    assert_eq!(
        cluster_to_infrastructure(&cluster),
        Some(ObjectRef::new(CLUSTER).within("ns"))
    );

    let mut other = test_capi_cluster("ns", CLUSTER);
    other.spec.infrastructure_ref.as_mut().unwrap().kind = "DockerCluster".to_string();
    assert_eq!(cluster_to_infrastructure(&other), None);
}
