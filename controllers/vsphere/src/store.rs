//! Orchestration store access
//!
//! Reconcilers read and write Kubernetes objects only through
//! `ResourceStore`, so they can run against the API server (`KubeStore`) or
//! against the in-memory `FakeStore` in unit tests.

use crate::error::ControllerError;
use crds::{
    Cluster, Machine, VSphereCluster, VSphereClusterIdentity, VSphereDeploymentZone, VSphereMachine,
    VSphereVM,
};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Object kinds the controller reads or writes
pub trait StoreResource:
    Resource<DynamicType = ()> + Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// API handle scoped to `namespace`, or cluster-wide
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_resource {
    ($($kind:ty),* $(,)?) => {
        $(impl StoreResource for $kind {
            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(ns) => Api::namespaced(client, ns),
                    None => Api::all(client),
                }
            }
        })*
    };
}

macro_rules! cluster_resource {
    ($($kind:ty),* $(,)?) => {
        $(impl StoreResource for $kind {
            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }
        })*
    };
}

namespaced_resource!(VSphereCluster, VSphereVM, VSphereMachine, Cluster, Machine, Secret);
cluster_resource!(VSphereDeploymentZone, VSphereClusterIdentity);

/// Get/list/patch/delete keyed by namespace and name
///
/// Merge patches carry `metadata.resourceVersion` when the caller wants
/// optimistic concurrency.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Fetch an object; `None` when it does not exist
    async fn get<K: StoreResource>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, ControllerError>;

    /// List objects, optionally filtered by an equality label selector
    async fn list<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, ControllerError>;

    /// JSON merge patch of metadata/spec
    async fn patch<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K, ControllerError>;

    /// JSON merge patch of the status subresource
    async fn patch_status<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K, ControllerError>;

    /// Delete an object; a missing object is not an error
    async fn delete<K: StoreResource>(&self, namespace: Option<&str>, name: &str) -> Result<(), ControllerError>;
}

/// `ResourceStore` backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: StoreResource>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, ControllerError> {
        Ok(K::api(self.client.clone(), namespace).get_opt(name).await?)
    }

    async fn list<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, ControllerError> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(K::api(self.client.clone(), namespace).list(&params).await?.items)
    }

    async fn patch<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K, ControllerError> {
        Ok(K::api(self.client.clone(), namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_status<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K, ControllerError> {
        Ok(K::api(self.client.clone(), namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn delete<K: StoreResource>(&self, namespace: Option<&str>, name: &str) -> Result<(), ControllerError> {
        match K::api(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
