//! VSphereClusterIdentity CRD
//!
//! Cluster-scoped credentials shared by several clusters. The referenced
//! secret lives in the controller's own namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VSphereClusterIdentity",
    status = "VSphereClusterIdentityStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterIdentitySpec {
    /// Secret in the controller namespace with `username` and `password`
    pub secret_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterIdentityStatus {
    /// Identity has been validated
    #[serde(default)]
    pub ready: bool,
}
