//! Reconciliation logic for the vSphere infrastructure resources.
//!
//! - `cluster`: `VSphereCluster` (failure domains, identity secret,
//!   connectivity, workload API server readiness)
//! - `vm`: `VSphereVM` (VM lifecycle through the `VmService`)
//!
//! Both reconcilers mutate an in-memory copy of the resource and write it
//! back once per pass with `patch_object`.

pub mod cluster;
pub mod vm;

use crate::backoff::BackoffRegistry;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::pollers::{ApiServerProbe, ApiServerTriggers};
use crate::reconcile_helpers::merge_diff;
use crate::store::{ResourceStore, StoreResource};
use crate::vmservice::VmServiceProvider;
use crds::VSphereCluster;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use kube::runtime::reflector::ObjectRef;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vsphere_client::SessionManager;

/// Delay before looking again at something that is not ready yet
pub const REQUEUE_AFTER: Duration = Duration::from_secs(10);

/// Interval of the post-patch guard and the API server poller
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state of both reconcilers
pub struct Context<S> {
    /// Orchestration store
    pub store: S,
    /// Platform session cache
    pub sessions: SessionManager,
    /// Picks the VM lifecycle implementation per vCenter
    pub vm_services: Arc<dyn VmServiceProvider>,
    /// Workload API server probe
    pub probe: Arc<dyn ApiServerProbe>,
    /// Running API server pollers, keyed by cluster UID
    pub triggers: ApiServerTriggers,
    /// Synthetic `VSphereCluster` re-triggers
    pub cluster_trigger: UnboundedSender<ObjectRef<VSphereCluster>>,
    /// Runtime configuration
    pub config: ControllerConfig,
    /// Per-object error backoff
    pub backoff: BackoffRegistry,
}

impl<S> Context<S> {
    /// Build a context; the receiver yields the synthetic re-triggers
    pub fn new(
        store: S,
        sessions: SessionManager,
        vm_services: Arc<dyn VmServiceProvider>,
        probe: Arc<dyn ApiServerProbe>,
        config: ControllerConfig,
    ) -> (Self, UnboundedReceiver<ObjectRef<VSphereCluster>>) {
        let (cluster_trigger, receiver) = mpsc::unbounded();
        let ctx = Self {
            store,
            sessions,
            vm_services,
            probe,
            triggers: ApiServerTriggers::default(),
            cluster_trigger,
            config,
            backoff: BackoffRegistry::default(),
        };
        (ctx, receiver)
    }
}

fn take_status(value: &mut Value) -> Value {
    value
        .as_object_mut()
        .and_then(|o| o.remove("status"))
        .unwrap_or(Value::Null)
}

/// Write the difference between `original` and `modified` back
///
/// The status subresource is patched first; metadata and spec follow with
/// the resourceVersion the status patch returned. Nothing is sent when the
/// object is unchanged, and an object that disappeared meanwhile is not an
/// error. Returns whether anything was written.
pub async fn patch_object<S, K>(store: &S, original: &K, modified: &K) -> Result<bool, ControllerError>
where
    S: ResourceStore,
    K: StoreResource,
{
    let meta = modified.meta();
    let name = meta.name.as_deref().ok_or(ControllerError::MissingObjectKey("name"))?;
    let namespace = meta.namespace.as_deref();

    let mut before = serde_json::to_value(original)?;
    let mut after = serde_json::to_value(modified)?;
    let status_before = take_status(&mut before);
    let status_after = take_status(&mut after);

    let mut resource_version = original.meta().resource_version.clone();
    let mut written: Option<K> = None;

    if let Some(diff) = merge_diff(&status_before, &status_after) {
        let mut body = Map::new();
        body.insert("status".to_string(), diff);
        match store.patch_status::<K>(namespace, name, &Value::Object(body)).await {
            Ok(obj) => {
                resource_version = obj.meta().resource_version.clone();
                written = Some(obj);
            }
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        }
    }

    if let Some(mut diff) = merge_diff(&before, &after) {
        if let (Some(rv), Value::Object(map)) = (&resource_version, &mut diff) {
            let metadata = map
                .entry("metadata")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(metadata) = metadata {
                metadata.insert("resourceVersion".to_string(), Value::String(rv.clone()));
            }
        }
        match store.patch::<K>(namespace, name, &diff).await {
            Ok(obj) => written = Some(obj),
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        }
    }

    let Some(written) = written else {
        return Ok(false);
    };
    wait_for_consistency(store, namespace, name, &written).await?;
    Ok(true)
}

/// Poll until the store reflects `written`
///
/// Done when the object is gone, carries a different resourceVersion, or
/// carries the same one with the status just written.
async fn wait_for_consistency<S, K>(
    store: &S,
    namespace: Option<&str>,
    name: &str,
    written: &K,
) -> Result<(), ControllerError>
where
    S: ResourceStore,
    K: StoreResource,
{
    let local_version = written.meta().resource_version.clone();
    let local_status = take_status(&mut serde_json::to_value(written)?);
    loop {
        match store.get::<K>(namespace, name).await {
            Ok(None) => return Ok(()),
            Ok(Some(remote)) => {
                if remote.meta().resource_version != local_version {
                    debug!(name, "Resource is patched");
                    return Ok(());
                }
                if take_status(&mut serde_json::to_value(&remote)?) == local_status {
                    return Ok(());
                }
                debug!(name, "Resource is not patched yet");
            }
            Err(e) => warn!(name, error = %e, "Failed to get resource while exiting reconcile"),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
