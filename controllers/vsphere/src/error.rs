//! Controller-specific error types.
//!
//! This module defines error types specific to the vSphere controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use thiserror::Error;
use vsphere_client::VSphereError;

/// Errors that can occur in the vSphere controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// vCenter error
    #[error("vSphere error: {0}")]
    VSphere(#[from] VSphereError),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Object is missing a required metadata field
    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),

    /// Credentials could not be resolved
    #[error("Credentials error: {0}")]
    Credentials(String),

    /// Another object already owns a resource
    #[error("Ownership conflict: {0}")]
    OwnershipConflict(String),

    /// Kubeconfig for a workload cluster is unusable
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    /// The platform does not support any known lifecycle implementation
    #[error("Unsupported platform: {0}")]
    Unsupported(String),

    /// A watch or controller task ended unexpectedly
    #[error("Watch error: {0}")]
    Watch(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),
}

impl ControllerError {
    /// Whether the error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            ControllerError::Kube(KubeError::Api(ae)) => ae.code == 404,
            ControllerError::VSphere(e) => e.is_not_found(),
            _ => false,
        }
    }
}
