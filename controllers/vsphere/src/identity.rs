//! Credential resolution
//!
//! A `VSphereCluster` may reference a Secret in its own namespace or a
//! cluster-scoped `VSphereClusterIdentity` whose Secret lives in the
//! controller namespace. Without a reference the controller's own
//! credentials are used.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconcile_helpers::owner_name;
use crate::store::ResourceStore;
use crds::{
    CLUSTER_NAME_LABEL, Cluster, INFRASTRUCTURE_GROUP, IdentityKind, VSphereCluster,
    VSphereClusterIdentity, VSphereMachine, VSphereVM,
};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::debug;
use vsphere_client::Credentials;

/// Secret key holding the username
pub const USERNAME_KEY: &str = "username";
/// Secret key holding the password
pub const PASSWORD_KEY: &str = "password";

/// Read `username`/`password` from a Secret
pub fn credentials_from_secret(secret: &Secret) -> Result<Credentials, ControllerError> {
    let read = |key: &str| {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .ok_or_else(|| {
                ControllerError::Credentials(format!("secret {} has no {:?} key", secret.name_any(), key))
            })?;
        String::from_utf8(bytes.0.clone())
            .map_err(|_| ControllerError::Credentials(format!("secret {} key {:?} is not UTF-8", secret.name_any(), key)))
    };
    Ok(Credentials::new(read(USERNAME_KEY)?, read(PASSWORD_KEY)?))
}

/// Credentials a cluster connects with
pub async fn cluster_credentials<S: ResourceStore>(
    store: &S,
    cluster: &VSphereCluster,
    config: &ControllerConfig,
) -> Result<Credentials, ControllerError> {
    let Some(identity) = &cluster.spec.identity_ref else {
        return Ok(config.credentials.clone());
    };

    let (namespace, secret_name) = match identity.kind {
        IdentityKind::Secret => {
            let namespace = cluster
                .namespace()
                .ok_or(ControllerError::MissingObjectKey("namespace"))?;
            (namespace, identity.name.clone())
        }
        IdentityKind::VSphereClusterIdentity => {
            let cluster_identity = store
                .get::<VSphereClusterIdentity>(None, &identity.name)
                .await?
                .ok_or_else(|| {
                    ControllerError::Credentials(format!("VSphereClusterIdentity {} not found", identity.name))
                })?;
            (config.controller_namespace.clone(), cluster_identity.spec.secret_name)
        }
    };

    let secret = store
        .get::<Secret>(Some(&namespace), &secret_name)
        .await?
        .ok_or_else(|| ControllerError::Credentials(format!("secret {}/{} not found", namespace, secret_name)))?;
    credentials_from_secret(&secret)
}

/// Credentials a VM connects with
///
/// Walks owner `VSphereMachine` → labelled Cluster API cluster → its
/// `VSphereCluster`. A missing link falls back to the controller's own
/// credentials; an identity reference that cannot be resolved is an error.
pub async fn vm_credentials<S: ResourceStore>(
    store: &S,
    vm: &VSphereVM,
    config: &ControllerConfig,
) -> Result<Credentials, ControllerError> {
    match owning_vsphere_cluster(store, vm).await? {
        Some(cluster) => cluster_credentials(store, &cluster, config).await,
        None => {
            debug!(vm = %vm.name_any(), "No VSphereCluster found, using controller credentials");
            Ok(config.credentials.clone())
        }
    }
}

async fn owning_vsphere_cluster<S: ResourceStore>(
    store: &S,
    vm: &VSphereVM,
) -> Result<Option<VSphereCluster>, ControllerError> {
    let Some(namespace) = vm.namespace() else {
        return Ok(None);
    };

    let machine = match owner_name(&vm.metadata, "VSphereMachine", INFRASTRUCTURE_GROUP) {
        Some(name) => store.get::<VSphereMachine>(Some(&namespace), name).await?,
        None => None,
    };
    let cluster_name = machine
        .as_ref()
        .and_then(|m| m.cluster_name().map(str::to_string))
        .or_else(|| vm.labels().get(CLUSTER_NAME_LABEL).cloned());
    let Some(cluster_name) = cluster_name else {
        return Ok(None);
    };

    let Some(cluster) = store.get::<Cluster>(Some(&namespace), &cluster_name).await? else {
        return Ok(None);
    };
    let Some(infra) = cluster
        .spec
        .infrastructure_ref
        .as_ref()
        .filter(|r| r.kind == "VSphereCluster")
    else {
        return Ok(None);
    };
    store.get::<VSphereCluster>(Some(&namespace), &infra.name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crds::IdentityReference;

    #[tokio::test]
    async fn test_no_identity_uses_controller_credentials() {
        let store = FakeStore::default();
        let cluster = test_vsphere_cluster("ns", "c", "vcenter.local");

        let creds = cluster_credentials(&store, &cluster, &test_config()).await.unwrap();
        assert_eq!(creds, test_config().credentials);
    }

    #[tokio::test]
    async fn test_secret_identity() {
        let store = FakeStore::default();
        store.insert(test_secret("ns", "creds", "alice", "pw"));
        let mut cluster = test_vsphere_cluster("ns", "c", "vcenter.local");
        cluster.spec.identity_ref = Some(IdentityReference {
            kind: IdentityKind::Secret,
            name: "creds".to_string(),
        });

        let creds = cluster_credentials(&store, &cluster, &test_config()).await.unwrap();
        assert_eq!(creds, Credentials::new("alice", "pw"));
    }

    #[tokio::test]
    async fn test_cluster_identity_reads_controller_namespace() {
        let store = FakeStore::default();
        store.insert(test_secret(CONTROLLER_NAMESPACE, "shared", "bob", "pw"));
        store.insert(VSphereClusterIdentity::new(
            "shared-identity",
            crds::VSphereClusterIdentitySpec {
                secret_name: "shared".to_string(),
            },
        ));
        let mut cluster = test_vsphere_cluster("ns", "c", "vcenter.local");
        cluster.spec.identity_ref = Some(IdentityReference {
            kind: IdentityKind::VSphereClusterIdentity,
            name: "shared-identity".to_string(),
        });

        let creds = cluster_credentials(&store, &cluster, &test_config()).await.unwrap();
        assert_eq!(creds.username, "bob");
    }

    #[tokio::test]
    async fn test_unresolvable_identity_is_an_error() {
        let store = FakeStore::default();
        let mut cluster = test_vsphere_cluster("ns", "c", "vcenter.local");
        cluster.spec.identity_ref = Some(IdentityReference {
            kind: IdentityKind::Secret,
            name: "missing".to_string(),
        });

        let result = cluster_credentials(&store, &cluster, &test_config()).await;
        assert!(matches!(result, Err(ControllerError::Credentials(_))));
    }

    #[tokio::test]
    async fn test_vm_walks_owner_chain() {
        let store = FakeStore::default();
        let fixture = VmFixture::new("ns", "worker-0");
        fixture.install(&store);
        store.insert(test_secret("ns", "creds", "carol", "pw"));
        let mut cluster: VSphereCluster = store.get_object(Some("ns"), &fixture.cluster_name).unwrap();
        cluster.spec.identity_ref = Some(IdentityReference {
            kind: IdentityKind::Secret,
            name: "creds".to_string(),
        });
        store.insert(cluster);

        let creds = vm_credentials(&store, &fixture.vm, &test_config()).await.unwrap();
        assert_eq!(creds.username, "carol");
    }

    #[tokio::test]
    async fn test_vm_without_owners_falls_back() {
        let store = FakeStore::default();
        let vm = test_vm("ns", "orphan");

        let creds = vm_credentials(&store, &vm, &test_config()).await.unwrap();
        assert_eq!(creds, test_config().credentials);
    }
}
