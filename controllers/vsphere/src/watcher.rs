//! Kubernetes resource watchers.
//!
//! One `kube_runtime::Controller` per reconciled kind. Related kinds are
//! registered with `watches` and a mapping function; the cluster
//! controller additionally consumes the API server poller's re-triggers
//! through `reconcile_on`.

use crate::error::ControllerError;
use crate::reconcile_helpers::object_key;
use crate::reconciler::vm::{PauseTracker, cluster_to_vms};
use crate::reconciler::{Context, cluster, vm};
use crate::store::{KubeStore, StoreResource};
use crds::{Cluster, VSphereCluster, VSphereDeploymentZone, VSphereMachine, VSphereVM};
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use kube::{Client, Resource};
use kube_runtime::controller::{Action, Config as RuntimeConfig};
use kube_runtime::reflector::{self, ObjectRef};
use kube_runtime::{Controller, WatchStreamExt, watcher};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Watcher timeout (seconds); below the client read timeout so idle
/// watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

type ReconcileContext = Context<KubeStore>;

fn watcher_config() -> watcher::Config {
    watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)
}

fn backoff_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!("{}/{}", K::kind(&()), object_key(obj))
}

/// Requeue with the object's Fibonacci backoff
fn error_policy<K: Resource<DynamicType = ()>>(obj: Arc<K>, error: &ControllerError, ctx: Arc<ReconcileContext>) -> Action {
    let delay = ctx.backoff.next(&backoff_key(&*obj));
    error!(
        kind = %K::kind(&()),
        object = %object_key(&*obj),
        error = %error,
        requeue_secs = delay.as_secs(),
        "Reconciliation failed"
    );
    Action::requeue(delay)
}

async fn reconcile_cluster(obj: Arc<VSphereCluster>, ctx: Arc<ReconcileContext>) -> Result<Action, ControllerError> {
    debug!(cluster = %object_key(&*obj), "Reconciling VSphereCluster");
    let action = cluster::reconcile(&*obj, &*ctx).await?;
    ctx.backoff.reset(&backoff_key(&*obj));
    Ok(action)
}

async fn reconcile_vm(obj: Arc<VSphereVM>, ctx: Arc<ReconcileContext>) -> Result<Action, ControllerError> {
    debug!(vm = %object_key(&*obj), "Reconciling VSphereVM");
    let action = vm::reconcile(&*obj, &*ctx).await?;
    ctx.backoff.reset(&backoff_key(&*obj));
    Ok(action)
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    ctx: Arc<ReconcileContext>,
    client: Client,
    namespace: Option<String>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(ctx: Arc<ReconcileContext>, client: Client) -> Self {
        let namespace = ctx.config.watch_namespace.clone();
        Self { ctx, client, namespace }
    }

    fn api<K: StoreResource>(&self) -> kube::Api<K> {
        K::api(self.client.clone(), self.namespace.as_deref())
    }

    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig::default().concurrency(self.ctx.config.max_concurrent_reconciles)
    }

    /// Runs the `VSphereCluster` controller until shutdown.
    ///
    /// `retriggers` carries the poller's requests to look at a cluster
    /// again once its workload API server answers.
    pub async fn watch_vsphere_clusters(
        &self,
        retriggers: UnboundedReceiver<ObjectRef<VSphereCluster>>,
    ) -> Result<(), ControllerError> {
        info!("Starting VSphereCluster watcher");

        // Cluster API clusters are only read by the machine mapping
        let (clusters, cluster_writer) = reflector::store::<Cluster>();
        let cluster_reflector = reflector::reflector(cluster_writer, watcher(self.api::<Cluster>(), watcher_config()))
            .default_backoff()
            .touched_objects()
            .for_each(|res| {
                if let Err(e) = res {
                    warn!(error = %e, "Cluster reflector error");
                }
                std::future::ready(())
            });

        let controller = Controller::new(self.api::<VSphereCluster>(), watcher_config()).with_config(self.runtime_config());
        let vsphere_clusters = controller.store();
        let vsphere_clusters_for_zones = vsphere_clusters.clone();

        let controller = controller
            .watches(self.api::<VSphereMachine>(), watcher_config(), move |machine| {
                cluster::control_plane_machine_to_cluster(
                    &machine,
                    |r| clusters.get(r),
                    |r| vsphere_clusters.get(r),
                )
            })
            .watches(
                VSphereDeploymentZone::api(self.client.clone(), None),
                watcher_config(),
                move |zone| {
                    let state = vsphere_clusters_for_zones.state();
                    cluster::deployment_zone_to_clusters(&zone, state.iter().map(|c| &**c))
                },
            )
            .watches(self.api::<Cluster>(), watcher_config(), |cluster| {
                cluster::cluster_to_infrastructure(&cluster)
            })
            .reconcile_on(retriggers)
            .shutdown_on_signal()
            .run(reconcile_cluster, error_policy, Arc::clone(&self.ctx))
            .for_each(log_reconcile_result("VSphereCluster"));

        tokio::select! {
            () = controller => {}
            () = cluster_reflector => {
                return Err(ControllerError::Watch("Cluster reflector ended".to_string()));
            }
        }
        info!("VSphereCluster watcher stopped");
        Ok(())
    }

    /// Runs the `VSphereVM` controller until shutdown.
    pub async fn watch_vsphere_vms(&self) -> Result<(), ControllerError> {
        info!("Starting VSphereVM watcher");

        let controller = Controller::new(self.api::<VSphereVM>(), watcher_config()).with_config(self.runtime_config());
        let vms = controller.store();
        let pauses = PauseTracker::default();

        controller
            .watches(self.api::<Cluster>(), watcher_config(), move |cluster| {
                if !pauses.observe(&cluster) {
                    return Vec::new();
                }
                let state = vms.state();
                cluster_to_vms(&cluster, state.iter().map(|c| &**c))
            })
            .shutdown_on_signal()
            .run(reconcile_vm, error_policy, Arc::clone(&self.ctx))
            .for_each(log_reconcile_result("VSphereVM"))
            .await;

        info!("VSphereVM watcher stopped");
        Ok(())
    }
}
