//! VSphereDeploymentZone CRD
//!
//! Cluster-scoped description of a placement target. Clusters adopt zones
//! explicitly through an annotation; adopted zones become failure domains.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VSphereDeploymentZone",
    status = "VSphereDeploymentZoneStatus",
    shortname = "vsdz"
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereDeploymentZoneSpec {
    /// vCenter endpoint the zone lives on
    pub server: String,

    /// Name of the failure domain this zone realises
    #[serde(default)]
    pub failure_domain: String,

    /// Whether control plane machines may be placed here (default true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereDeploymentZoneStatus {
    /// Unset until the zone has been validated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
}

impl VSphereDeploymentZone {
    /// Control plane eligibility, defaulting to true
    pub fn control_plane(&self) -> bool {
        self.spec.control_plane.unwrap_or(true)
    }

    /// Reported readiness, `None` while not reported
    pub fn ready(&self) -> Option<bool> {
        self.status.as_ref().and_then(|s| s.ready)
    }
}
