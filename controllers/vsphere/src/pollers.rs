//! Background pollers
//!
//! The cluster reconciler waits for the workload API server without
//! blocking a reconcile slot: it spawns at most one poller per cluster,
//! guarded by `ApiServerTriggers`.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{KUBECONFIG_SECRET_KEY, kubeconfig_secret_name};
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Dedup set of running pollers, keyed by cluster UID
#[derive(Debug, Clone, Default)]
pub struct ApiServerTriggers {
    running: Arc<Mutex<HashSet<String>>>,
}

/// Holds a key in `ApiServerTriggers`; releases it on drop, including
/// when the owning task panics
#[derive(Debug)]
pub struct TriggerGuard {
    running: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for TriggerGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl ApiServerTriggers {
    fn running(&self) -> MutexGuard<'_, HashSet<String>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a poller holds `key`
    pub fn contains(&self, key: &str) -> bool {
        self.running().contains(key)
    }

    /// Claim `key`; `None` if it is already held
    pub fn try_acquire(&self, key: &str) -> Option<TriggerGuard> {
        if !self.running().insert(key.to_string()) {
            return None;
        }
        Some(TriggerGuard {
            running: Arc::clone(&self.running),
            key: key.to_string(),
        })
    }

    /// Run `task` unless a task for `key` is already running
    ///
    /// The returned receiver resolves when the task finishes; it errors if
    /// the task panicked.
    pub fn spawn_once<F>(&self, key: &str, task: F) -> Option<oneshot::Receiver<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.try_acquire(key)?;
        let (done, receiver) = oneshot::channel();
        tokio::spawn(async move {
            task.await;
            drop(guard);
            let _ = done.send(());
        });
        Some(receiver)
    }
}

/// Checks whether a workload cluster's API server answers
#[async_trait]
pub trait ApiServerProbe: Send + Sync {
    /// `true` once a node listing succeeds
    async fn is_online(&self, namespace: &str, cluster_name: &str) -> bool;
}

/// Probe using the `<cluster>-kubeconfig` secret
#[derive(Clone)]
pub struct KubeconfigProbe {
    client: Client,
}

impl std::fmt::Debug for KubeconfigProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeconfigProbe").finish_non_exhaustive()
    }
}

impl KubeconfigProbe {
    /// Probe that reads kubeconfig secrets with `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn workload_client(&self, namespace: &str, cluster_name: &str) -> Result<Client, ControllerError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret_name = kubeconfig_secret_name(cluster_name);
        let secret = secrets
            .get_opt(&secret_name)
            .await?
            .ok_or_else(|| ControllerError::Kubeconfig(format!("secret {}/{} not found", namespace, secret_name)))?;
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| ControllerError::Kubeconfig(format!("secret {} has no {:?} key", secret_name, KUBECONFIG_SECRET_KEY)))?;
        let yaml = std::str::from_utf8(&bytes.0).map_err(|e| ControllerError::Kubeconfig(e.to_string()))?;

        let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| ControllerError::Kubeconfig(e.to_string()))?;
        let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ControllerError::Kubeconfig(e.to_string()))?;
        config.connect_timeout = Some(Duration::from_secs(10));
        config.read_timeout = Some(Duration::from_secs(10));
        Ok(Client::try_from(config)?)
    }
}

#[async_trait]
impl ApiServerProbe for KubeconfigProbe {
    async fn is_online(&self, namespace: &str, cluster_name: &str) -> bool {
        let client = match self.workload_client(namespace, cluster_name).await {
            Ok(client) => client,
            Err(e) => {
                debug!(namespace, cluster = cluster_name, error = %e, "Workload API server not reachable yet");
                return false;
            }
        };
        let nodes: Api<Node> = Api::all(client);
        match nodes.list(&ListParams::default().limit(1)).await {
            Ok(_) => true,
            Err(e) => {
                debug!(namespace, cluster = cluster_name, error = %e, "Workload API server not answering yet");
                false
            }
        }
    }
}
