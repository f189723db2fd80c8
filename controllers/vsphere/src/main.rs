//! vSphere Controller
//!
//! Cluster API infrastructure provider for vSphere:
//! - VSphereCluster: failure domains, identity secret ownership, vCenter
//!   connectivity and workload API server readiness
//! - VSphereVM: VM lifecycle on vCenter through a version-selected service
//!
//! Sessions to vCenter are cached and shared by both reconcilers.

mod backoff;
mod config;
mod controller;
mod error;
mod identity;
mod pollers;
mod reconcile_helpers;
mod reconciler;
mod store;
mod vmservice;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider already installed");
    }

    info!("Starting vSphere Controller");

    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Controller namespace: {}", config.controller_namespace);
    info!("  Max concurrent reconciles: {}", config.max_concurrent_reconciles);
    info!(
        "  Keep-alive: {} ({}s)",
        config.feature.enable_keep_alive,
        config.feature.keep_alive_duration.as_secs()
    );

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
