//! Wire constants shared by the controllers
//!
//! Finalizers, annotations and labels are part of the contract with other
//! Cluster API components and must not change.

/// API group of the infrastructure resources
pub const INFRASTRUCTURE_GROUP: &str = "infrastructure.cluster.x-k8s.io";
/// API version of the infrastructure resources
pub const INFRASTRUCTURE_VERSION: &str = "v1beta1";
/// `apiVersion` string of the infrastructure resources
pub const INFRASTRUCTURE_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";
/// `apiVersion` string of the Cluster API core resources
pub const CLUSTER_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// Blocks deletion of a `VSphereCluster` until its machines are gone
pub const CLUSTER_FINALIZER: &str = "vspherecluster.infrastructure.cluster.x-k8s.io";
/// Blocks deletion of a `VSphereVM` until the platform VM is destroyed
pub const VM_FINALIZER: &str = "vspherevm.infrastructure.cluster.x-k8s.io";
/// Protects an identity secret while a cluster still references it
pub const SECRET_IDENTITY_FINALIZER: &str = "vspherecluster/infrastructure.cluster.x-k8s.io";

/// Colon separated list of deployment zones a cluster adopts
pub const ADOPT_DEPLOYMENT_ZONE_ANNOTATION: &str =
    "vsphere.infrastructure.cluster.x-k8s.io/adopt-deploymentzone";
/// Presence pauses reconciliation of the annotated object
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Name of the Cluster API cluster an object belongs to
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
/// Presence marks a machine as part of the control plane
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Data key holding the kubeconfig in `<cluster>-kubeconfig` secrets
pub const KUBECONFIG_SECRET_KEY: &str = "value";

/// Name of the kubeconfig secret Cluster API writes for a workload cluster
pub fn kubeconfig_secret_name(cluster_name: &str) -> String {
    format!("{}-kubeconfig", cluster_name)
}
