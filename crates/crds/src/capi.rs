//! Mirrored Cluster API core types
//!
//! Only the fields the infrastructure controllers read are modelled; the
//! rest of the upstream schema is preserved by the API server untouched.

use crate::conditions::{Condition, HasConditions};
use crate::constants::PAUSED_ANNOTATION;
use crate::vsphere_cluster::ApiEndpoint;
use kube::CustomResource;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object of an arbitrary kind
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// API version of the referent
    #[serde(default)]
    pub api_version: String,

    /// Kind of the referent
    #[serde(default)]
    pub kind: String,

    /// Name of the referent
    pub name: String,

    /// Namespace of the referent (defaults to the referencing object's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Pauses reconciliation of the cluster and everything it owns
    #[serde(default)]
    pub paused: bool,

    /// Workload API server endpoint
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// The infrastructure cluster object, e.g. a `VSphereCluster`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Lifecycle phase reported by Cluster API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for Cluster {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(group = "cluster.x-k8s.io", version = "v1beta1", kind = "Machine", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the owning cluster
    #[serde(default)]
    pub cluster_name: String,

    /// Failure domain chosen for this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,

    /// The infrastructure machine object, e.g. a `VSphereMachine`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

/// Whether the object carries the paused annotation
pub fn has_paused_annotation(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(PAUSED_ANNOTATION))
}

/// Reconciliation is paused when the cluster is paused or the object is
/// annotated as paused
pub fn is_paused(cluster: &Cluster, meta: &ObjectMeta) -> bool {
    cluster.spec.paused || has_paused_annotation(meta)
}
