//! VSphereCluster CRD
//!
//! Infrastructure side of a Cluster API cluster running on vSphere.

use crate::conditions::{Condition, HasConditions};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VSphereCluster",
    namespaced,
    status = "VSphereClusterStatus",
    shortname = "vsc"
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterSpec {
    /// vCenter endpoint (host, host:port or URL)
    pub server: String,

    /// Datacenter the connectivity probe must be able to resolve (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,

    /// SHA-1 thumbprint of the vCenter certificate; empty means insecure
    #[serde(default)]
    pub thumbprint: String,

    /// Endpoint of the workload cluster API server, set once known
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// Credentials to use instead of the controller's own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_ref: Option<IdentityReference>,
}

/// Host and port of an API server
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    /// Hostname or IP
    #[serde(default)]
    pub host: String,

    /// Port
    #[serde(default)]
    pub port: i32,
}

impl ApiEndpoint {
    /// An endpoint is unset when neither host nor port is filled in
    pub fn is_zero(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }
}

impl std::fmt::Display for ApiEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Kind of object an identity reference points to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum IdentityKind {
    /// A Secret in the cluster's namespace holding `username`/`password`
    Secret,
    /// A cluster-scoped `VSphereClusterIdentity`
    VSphereClusterIdentity,
}

/// Reference to the credentials a cluster uses
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityReference {
    /// Kind of the referenced object
    pub kind: IdentityKind,

    /// Name of the referenced object
    pub name: String,
}

/// A failure domain exposed to Cluster API
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomainSpec {
    /// Whether control plane machines may be placed here
    #[serde(default)]
    pub control_plane: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterStatus {
    /// Infrastructure is ready for machines
    #[serde(default)]
    pub ready: bool,

    /// Adopted deployment zones keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_domains: BTreeMap<String, FailureDomainSpec>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl VSphereCluster {
    /// Whether the identity reference points at a plain Secret
    pub fn has_secret_identity(&self) -> bool {
        self.spec
            .identity_ref
            .as_ref()
            .is_some_and(|r| r.kind == IdentityKind::Secret)
    }

    /// Names listed in the deployment zone adoption annotation
    ///
    /// `None` when the annotation is absent, meaning no zone is adopted.
    pub fn adopted_zones(&self) -> Option<Vec<&str>> {
        self.metadata
            .annotations
            .as_ref()?
            .get(crate::constants::ADOPT_DEPLOYMENT_ZONE_ANNOTATION)
            .map(|v| v.split(':').collect())
    }
}

impl HasConditions for VSphereCluster {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}
