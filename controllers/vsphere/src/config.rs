//! Controller configuration from environment variables

use crate::error::ControllerError;
use std::time::Duration;
use vsphere_client::session::{DEFAULT_KEEP_ALIVE_DURATION, Feature};
use vsphere_client::Credentials;

/// Namespace the controller runs in when `POD_NAMESPACE` is unset
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "capv-system";

/// Default number of concurrent reconciles per kind
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: u16 = 10;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    /// Namespace holding `VSphereClusterIdentity` secrets
    pub controller_namespace: String,
    /// Fallback credentials when a cluster has no identity
    pub credentials: Credentials,
    /// Per-kind reconcile concurrency
    pub max_concurrent_reconciles: u16,
    /// Session keep-alive
    pub feature: Feature,
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ControllerError::InvalidConfig(format!("{} environment variable is required", key)))
        };

        let max_concurrent_reconciles = match lookup("MAX_CONCURRENT_RECONCILES") {
            Some(v) => v
                .parse::<u16>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ControllerError::InvalidConfig(format!("MAX_CONCURRENT_RECONCILES={:?}", v)))?,
            None => DEFAULT_MAX_CONCURRENT_RECONCILES,
        };

        let enable_keep_alive = match lookup("ENABLE_KEEP_ALIVE") {
            Some(v) => v
                .parse::<bool>()
                .map_err(|_| ControllerError::InvalidConfig(format!("ENABLE_KEEP_ALIVE={:?}", v)))?,
            None => false,
        };

        let keep_alive_duration = match lookup("KEEP_ALIVE_DURATION_SECS") {
            Some(v) => v
                .parse::<u64>()
                .ok()
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| ControllerError::InvalidConfig(format!("KEEP_ALIVE_DURATION_SECS={:?}", v)))?,
            None => DEFAULT_KEEP_ALIVE_DURATION,
        };

        Ok(Self {
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|v| !v.is_empty()),
            controller_namespace: lookup("POD_NAMESPACE")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTROLLER_NAMESPACE.to_string()),
            credentials: Credentials::new(required("VSPHERE_USERNAME")?, required("VSPHERE_PASSWORD")?),
            max_concurrent_reconciles,
            feature: Feature {
                enable_keep_alive,
                keep_alive_duration,
            },
        })
    }
}
