//! vSphere platform client
//!
//! Access to vCenter for the vSphere controllers: a REST client for the
//! vSphere Automation API, certificate thumbprint pinning, and a cache of
//! authenticated sessions shared by every reconcile pass.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vsphere_client::{Credentials, Params, RestConnector, SessionManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sessions = SessionManager::new(Arc::new(RestConnector::new()));
//!
//! let params = Params::new("vcenter.example.com")
//!     .with_datacenter("dc0")
//!     .with_credentials(Credentials::new("administrator@vsphere.local", "secret"))
//!     .with_thumbprint("AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01");
//!
//! let session = sessions.get_or_create(&params).await?;
//! let vm = session.find_by_bios_uuid("4215a0b2-0000-0000-0000-000000000000").await?;
//! println!("found {}", vm);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Session cache**: one session per server, user and datacenter
//! - **Keep-alive**: optional idle-time liveness probes with eviction
//! - **Thumbprint pinning**: SHA-1 fingerprint verification of self-signed vCenter certificates
//! - **`test-util`**: an in-memory `MockConnector`

pub mod client;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod models;
#[path = "trait.rs"]
pub mod platform_trait;
pub mod session;
pub mod tls;

pub use client::RestConnector;
pub use error::VSphereError;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockConnector;
pub use models::*;
pub use platform_trait::{PlatformConnector, TagClient, VimClient};
pub use session::{Feature, Params, Session, SessionKey, SessionManager, parse_endpoint};
