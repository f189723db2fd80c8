//! Test utilities for unit testing reconcilers
//!
//! `FakeStore` keeps objects as JSON and applies merge patches the way the
//! API server does, so reconcilers run unchanged against it. The fixtures
//! build the usual Cluster API object graph around a `VSphereVM`.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::pollers::ApiServerProbe;
use crate::reconciler::Context;
use crate::store::{ResourceStore, StoreResource};
use crate::vmservice::{VirtualMachine, VmContext, VmService, VmServiceProvider, VmState};
use async_trait::async_trait;
use crds::*;
use futures::channel::mpsc::UnboundedReceiver;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use kube::runtime::reflector::ObjectRef;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use vsphere_client::{Credentials, Feature, MockConnector, Session, SessionManager};

/// Namespace the test controller runs in
pub const CONTROLLER_NAMESPACE: &str = "capv-system";

/// vCenter used by the fixtures
pub const TEST_SERVER: &str = "vcenter.local";

/// Controller configuration used by tests
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        watch_namespace: None,
        controller_namespace: CONTROLLER_NAMESPACE.to_string(),
        credentials: Credentials::new("manager", "manager-password"),
        max_concurrent_reconciles: 1,
        feature: Feature::default(),
    }
}

type ObjectKey = (String, String, String);

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ObjectKey, Value>,
    version: u64,
    uid: u64,
    patches: Vec<String>,
}

impl FakeState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// In-memory `ResourceStore`
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<FakeState>>,
}

fn key<K: StoreResource>(namespace: Option<&str>, name: &str) -> ObjectKey {
    (
        K::kind(&()).to_string(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> ControllerError {
    ControllerError::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

// RFC 7386
fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let target = target.as_object_mut().unwrap();
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            apply_merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

fn matches_selector(obj: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = obj.pointer("/metadata/labels");
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).and_then(Value::as_str) == Some(v),
            None => labels.and_then(|l| l.get(term)).is_some(),
        }
    })
}

fn finalizers_drained(obj: &Value) -> bool {
    obj.pointer("/metadata/deletionTimestamp").is_some()
        && obj
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .is_none_or(|f| f.is_empty())
}

impl FakeStore {
    /// Insert or replace an object, assigning a resourceVersion and uid
    pub fn insert<K: StoreResource>(&self, obj: K) {
        let meta = obj.meta();
        let key = key::<K>(meta.namespace.as_deref(), meta.name.as_deref().unwrap());
        let mut value = serde_json::to_value(&obj).unwrap();
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let existing = state
            .objects
            .get(&key)
            .and_then(|v| v.pointer("/metadata/uid"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let uid = match meta.uid.clone().or(existing) {
            Some(uid) => uid,
            None => {
                state.uid += 1;
                format!("uid-{}", state.uid)
            }
        };
        let metadata = value["metadata"].as_object_mut().unwrap();
        metadata.insert("resourceVersion".to_string(), Value::String(version));
        metadata.insert("uid".to_string(), Value::String(uid));
        state.objects.insert(key, value);
    }

    /// Current copy of an object
    pub fn get_object<K: StoreResource>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Whether an object exists
    pub fn contains<K: StoreResource>(&self, namespace: Option<&str>, name: &str) -> bool {
        self.get_object::<K>(namespace, name).is_some()
    }

    /// Remove an object regardless of finalizers
    pub fn remove<K: StoreResource>(&self, namespace: Option<&str>, name: &str) {
        self.state.lock().unwrap().objects.remove(&key::<K>(namespace, name));
    }

    /// Number of patches applied so far, status and metadata counted apart
    pub fn patch_count(&self) -> usize {
        self.state.lock().unwrap().patches.len()
    }

    fn apply(
        &self,
        key: ObjectKey,
        patch: &Value,
        subresource: &str,
    ) -> Result<Value, ControllerError> {
        let mut state = self.state.lock().unwrap();
        let Some(mut current) = state.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound", format!("{} {} not found", key.0, key.2)));
        };
        if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            let actual = current.pointer("/metadata/resourceVersion").and_then(Value::as_str);
            if actual != Some(expected) {
                return Err(api_error(409, "Conflict", format!("{} {} was modified", key.0, key.2)));
            }
        }

        apply_merge_patch(&mut current, patch);
        let version = state.next_version();
        current["metadata"]["resourceVersion"] = Value::String(version);
        state.patches.push(format!("{}/{}:{}", key.0, key.2, subresource));

        if finalizers_drained(&current) {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, current.clone());
        }
        Ok(current)
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn get<K: StoreResource>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, ControllerError> {
        Ok(self.get_object(namespace, name))
    }

    async fn list<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, ControllerError> {
        let kind = K::kind(&()).to_string();
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.is_none_or(|n| n == ns))
            .filter(|(_, v)| matches_selector(v, label_selector))
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect())
    }

    async fn patch<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K, ControllerError> {
        let mut body = patch.clone();
        if let Some(map) = body.as_object_mut() {
            map.remove("status");
        }
        let value = self.apply(key::<K>(namespace, name), &body, "metadata")?;
        Ok(serde_json::from_value(value)?)
    }

    async fn patch_status<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K, ControllerError> {
        let mut body = json!({ "status": patch.get("status").cloned().unwrap_or(Value::Null) });
        if let Some(rv) = patch.pointer("/metadata/resourceVersion") {
            body["metadata"] = json!({ "resourceVersion": rv });
        }
        let value = self.apply(key::<K>(namespace, name), &body, "status")?;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete<K: StoreResource>(&self, namespace: Option<&str>, name: &str) -> Result<(), ControllerError> {
        let key = key::<K>(namespace, name);
        let mut state = self.state.lock().unwrap();
        let Some(current) = state.objects.get(&key).cloned() else {
            return Ok(());
        };
        let has_finalizers = current
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        if !has_finalizers {
            state.objects.remove(&key);
            return Ok(());
        }
        let version = state.next_version();
        let obj = state.objects.get_mut(&key).unwrap();
        obj["metadata"]["deletionTimestamp"] = Value::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        obj["metadata"]["resourceVersion"] = Value::String(version);
        Ok(())
    }
}

/// `VSphereCluster` pointing at `server`
pub fn test_vsphere_cluster(namespace: &str, name: &str, server: &str) -> VSphereCluster {
    let mut cluster = VSphereCluster::new(
        name,
        VSphereClusterSpec {
            server: server.to_string(),
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some(namespace.to_string());
    cluster
}

/// Cluster API `Cluster` whose infrastructure is the `VSphereCluster` of the same name
pub fn test_capi_cluster(namespace: &str, name: &str) -> Cluster {
    let mut cluster = Cluster::new(
        name,
        ClusterSpec {
            infrastructure_ref: Some(ObjectReference {
                api_version: INFRASTRUCTURE_API_VERSION.to_string(),
                kind: "VSphereCluster".to_string(),
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
            }),
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some(namespace.to_string());
    cluster.metadata.uid = Some(format!("{}-uid", name));
    cluster
}

/// Owner reference to `owner` as Cluster API sets it
pub fn owner_ref<K: Resource<DynamicType = ()>>(owner: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.meta().name.clone().unwrap(),
        uid: owner.meta().uid.clone().unwrap_or_else(|| "owner-uid".to_string()),
        controller: Some(true),
        ..Default::default()
    }
}

/// Secret with `username`/`password`
pub fn test_secret(namespace: &str, name: &str, username: &str, password: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("username".to_string(), ByteString(username.as_bytes().to_vec())),
            ("password".to_string(), ByteString(password.as_bytes().to_vec())),
        ])),
        ..Default::default()
    }
}

/// DHCP-configured `VSphereVM` cloned from `ubuntu-template` in `dc0`
pub fn test_vm(namespace: &str, name: &str) -> VSphereVM {
    let mut vm = VSphereVM::new(
        name,
        VSphereVMSpec {
            server: TEST_SERVER.to_string(),
            datacenter: "dc0".to_string(),
            template: "ubuntu-template".to_string(),
            network: NetworkSpec {
                devices: vec![NetworkDeviceSpec {
                    network_name: "VM Network".to_string(),
                    dhcp4: true,
                    ..Default::default()
                }],
            },
            ..Default::default()
        },
    );
    vm.metadata.namespace = Some(namespace.to_string());
    vm
}

fn cluster_labels(cluster_name: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string())]))
}

/// A `VSphereVM` with its full owner chain
///
/// `VSphereVM` → `VSphereMachine` → `Machine`, all labelled with the
/// cluster name, plus the Cluster API `Cluster` and its `VSphereCluster`.
pub struct VmFixture {
    /// The VM
    pub vm: VSphereVM,
    /// Owning `VSphereMachine`
    pub vsphere_machine: VSphereMachine,
    /// Owning Cluster API `Machine`
    pub machine: Machine,
    /// Cluster API cluster name
    pub cluster_name: String,
}

impl VmFixture {
    /// Object graph for a VM named `name` in cluster `workload`
    pub fn new(namespace: &str, name: &str) -> Self {
        let cluster_name = "workload".to_string();

        let mut machine = Machine::new(
            name,
            MachineSpec {
                cluster_name: cluster_name.clone(),
                ..Default::default()
            },
        );
        machine.metadata.namespace = Some(namespace.to_string());
        machine.metadata.uid = Some(format!("{}-machine-uid", name));
        machine.metadata.labels = cluster_labels(&cluster_name);

        let mut vsphere_machine = VSphereMachine::new(name, VSphereMachineSpec::default());
        vsphere_machine.metadata.namespace = Some(namespace.to_string());
        vsphere_machine.metadata.uid = Some(format!("{}-vsphere-machine-uid", name));
        vsphere_machine.metadata.labels = cluster_labels(&cluster_name);
        vsphere_machine.metadata.owner_references = Some(vec![owner_ref(&machine)]);

        let mut vm = test_vm(namespace, name);
        vm.metadata.labels = cluster_labels(&cluster_name);
        vm.metadata.owner_references = Some(vec![owner_ref(&vsphere_machine)]);

        Self {
            vm,
            vsphere_machine,
            machine,
            cluster_name,
        }
    }

    /// Insert every object of the graph into `store`
    pub fn install(&self, store: &FakeStore) {
        let namespace = self.vm.metadata.namespace.as_deref().unwrap();
        store.insert(test_capi_cluster(namespace, &self.cluster_name));
        store.insert(test_vsphere_cluster(namespace, &self.cluster_name, TEST_SERVER));
        store.insert(self.machine.clone());
        store.insert(self.vsphere_machine.clone());
        store.insert(self.vm.clone());
    }
}

#[derive(Debug)]
struct FakeVmState {
    reported: VirtualMachine,
    destroy_state: VmState,
    destroy_error: Option<String>,
    reconcile_calls: usize,
    destroy_calls: usize,
    failure_domains: Vec<Option<String>>,
}

/// `VmService` reporting canned results
#[derive(Debug)]
pub struct FakeVmService {
    state: Mutex<FakeVmState>,
}

impl FakeVmService {
    /// Reports `vm` from every `reconcile_vm`; deletion succeeds at once
    pub fn reporting(vm: VirtualMachine) -> Self {
        Self {
            state: Mutex::new(FakeVmState {
                reported: vm,
                destroy_state: VmState::NotFound,
                destroy_error: None,
                reconcile_calls: 0,
                destroy_calls: 0,
                failure_domains: Vec::new(),
            }),
        }
    }

    /// A ready VM with one NIC carrying `ips`
    pub fn ready(bios_uuid: &str, ips: &[&str]) -> Self {
        Self::reporting(VirtualMachine {
            name: String::new(),
            state: VmState::Ready,
            bios_uuid: bios_uuid.to_string(),
            network: vec![NetworkStatus {
                connected: true,
                ip_addrs: ips.iter().map(|ip| ip.to_string()).collect(),
                mac_addr: "00:50:56:00:00:01".to_string(),
                network_name: Some("VM Network".to_string()),
            }],
        })
    }

    /// State `destroy_vm` reports
    pub fn set_destroy_state(&self, state: VmState) {
        self.state.lock().unwrap().destroy_state = state;
    }

    /// Make `destroy_vm` fail with `message`
    pub fn fail_destroy(&self, message: &str) {
        self.state.lock().unwrap().destroy_error = Some(message.to_string());
    }

    /// Number of `reconcile_vm` calls
    pub fn reconcile_calls(&self) -> usize {
        self.state.lock().unwrap().reconcile_calls
    }

    /// Number of `destroy_vm` calls
    pub fn destroy_calls(&self) -> usize {
        self.state.lock().unwrap().destroy_calls
    }

    /// Failure domain passed to each `reconcile_vm` call
    pub fn failure_domains(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().failure_domains.clone()
    }
}

#[async_trait]
impl VmService for FakeVmService {
    async fn reconcile_vm(&self, ctx: VmContext<'_>) -> Result<VirtualMachine, ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.reconcile_calls += 1;
        state.failure_domains.push(ctx.failure_domain.map(str::to_string));
        Ok(state.reported.clone())
    }

    async fn destroy_vm(&self, _ctx: VmContext<'_>) -> Result<VirtualMachine, ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.destroy_calls += 1;
        if let Some(message) = &state.destroy_error {
            return Err(ControllerError::Reconciliation(message.clone()));
        }
        Ok(VirtualMachine {
            state: state.destroy_state,
            ..Default::default()
        })
    }
}

/// Hands out the same `FakeVmService` for every session
pub struct FakeVmServiceProvider(pub Arc<FakeVmService>);

#[async_trait]
impl VmServiceProvider for FakeVmServiceProvider {
    async fn service_for(&self, _session: &Session) -> Result<Arc<dyn VmService>, ControllerError> {
        Ok(self.0.clone())
    }
}

/// `ApiServerProbe` with a switchable answer
#[derive(Debug, Default)]
pub struct FakeProbe {
    online: AtomicBool,
    calls: AtomicUsize,
}

impl FakeProbe {
    /// Switch the reported API server state
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of probes so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApiServerProbe for FakeProbe {
    async fn is_online(&self, _namespace: &str, _cluster_name: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.online.load(Ordering::SeqCst)
    }
}

/// A reconciler context wired to fakes
pub struct Harness {
    /// Object store
    pub store: FakeStore,
    /// Platform behind the session manager
    pub connector: MockConnector,
    /// Lifecycle service handed to the VM reconciler
    pub vm_service: Arc<FakeVmService>,
    /// Workload API server probe
    pub probe: Arc<FakeProbe>,
    /// The context under test
    pub ctx: Arc<Context<FakeStore>>,
    /// Synthetic cluster re-triggers
    pub retriggers: UnboundedReceiver<ObjectRef<VSphereCluster>>,
}

impl Harness {
    /// Harness whose lifecycle service reports a ready VM at `10.0.0.10`
    pub fn new() -> Self {
        Self::with_vm_service(FakeVmService::ready("4215a1b2-0000-0000-0000-000000000001", &["10.0.0.10"]))
    }

    /// Harness with a custom lifecycle service
    pub fn with_vm_service(vm_service: FakeVmService) -> Self {
        let store = FakeStore::default();
        let connector = MockConnector::new();
        connector.add_datacenter("dc0");
        let vm_service = Arc::new(vm_service);
        let probe = Arc::new(FakeProbe::default());
        let (ctx, retriggers) = Context::new(
            store.clone(),
            SessionManager::new(Arc::new(connector.clone())),
            Arc::new(FakeVmServiceProvider(vm_service.clone())),
            probe.clone(),
            test_config(),
        );
        Self {
            store,
            connector,
            vm_service,
            probe,
            ctx: Arc::new(ctx),
            retriggers,
        }
    }
}
