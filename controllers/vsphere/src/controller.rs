//! Main controller implementation.
//!
//! `Controller` builds the shared reconcile context and runs the
//! `VSphereCluster` and `VSphereVM` watchers as background tasks.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::pollers::KubeconfigProbe;
use crate::reconciler::Context;
use crate::store::KubeStore;
use crate::vmservice::CapabilityDetector;
use crate::watcher::Watcher;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use vsphere_client::{RestConnector, SessionManager};

/// Main controller for vSphere infrastructure resources.
#[derive(Debug)]
pub struct Controller {
    vsphere_cluster_watcher: JoinHandle<Result<(), ControllerError>>,
    vsphere_vm_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing vSphere Controller");

        let client = Client::try_default().await?;

        let sessions = SessionManager::new(Arc::new(RestConnector::new()));
        let (ctx, retriggers) = Context::new(
            KubeStore::new(client.clone()),
            sessions,
            Arc::new(CapabilityDetector::default()),
            Arc::new(KubeconfigProbe::new(client.clone())),
            config,
        );
        let ctx = Arc::new(ctx);

        let cluster_watcher = Watcher::new(Arc::clone(&ctx), client.clone());
        let vm_watcher = Watcher::new(ctx, client);

        let vsphere_cluster_watcher =
            tokio::spawn(async move { cluster_watcher.watch_vsphere_clusters(retriggers).await });
        let vsphere_vm_watcher = tokio::spawn(async move { vm_watcher.watch_vsphere_vms().await });

        Ok(Self {
            vsphere_cluster_watcher,
            vsphere_vm_watcher,
        })
    }

    /// Runs the controller until shutdown.
    ///
    /// Returns as soon as either watcher stops; both stop together on
    /// SIGTERM/SIGINT.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("vSphere Controller running");

        tokio::select! {
            result = &mut self.vsphere_cluster_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("VSphereCluster watcher panicked: {}", e)))??;
            }
            result = &mut self.vsphere_vm_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("VSphereVM watcher panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
