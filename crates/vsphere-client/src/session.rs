//! Cached platform sessions
//!
//! `SessionManager` keeps at most one authenticated `Session` per
//! (server, username, datacenter). A session is either fully initialized or
//! not cached at all; it is never mutated in place. Invalid sessions are
//! evicted and rebuilt on the next request.

use crate::error::VSphereError;
use crate::models::{Credentials, Datacenter, ManagedObjectReference};
use crate::platform_trait::{PlatformConnector, TagClient, VimClient};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default keep-alive idle interval
pub const DEFAULT_KEEP_ALIVE_DURATION: Duration = Duration::from_secs(5 * 60);

/// Optional session behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feature {
    /// Probe the session whenever it has been idle for `keep_alive_duration`
    pub enable_keep_alive: bool,
    /// Idle interval between keep-alive probes
    pub keep_alive_duration: Duration,
}

impl Default for Feature {
    fn default() -> Self {
        Self {
            enable_keep_alive: false,
            keep_alive_duration: DEFAULT_KEEP_ALIVE_DURATION,
        }
    }
}

/// Parameters for `SessionManager::get_or_create`
#[derive(Debug, Clone, Default)]
pub struct Params {
    server: String,
    datacenter: String,
    credentials: Option<Credentials>,
    thumbprint: String,
    feature: Feature,
    refresh: bool,
    caller: String,
}

impl Params {
    /// Parameters for `server` (bare host, `host:port` or URL)
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Default::default()
        }
    }

    /// Scope the session's finder to a datacenter
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = datacenter.into();
        self
    }

    /// Credentials to log in with
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Pin the server certificate; empty means insecure
    pub fn with_thumbprint(mut self, thumbprint: impl Into<String>) -> Self {
        self.thumbprint = thumbprint.into();
        self
    }

    /// Session features
    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.feature = feature;
        self
    }

    /// Validate a cached session before handing it out
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Name of the caller, for logging only
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    fn key(&self) -> SessionKey {
        SessionKey {
            server: self.server.clone(),
            username: self
                .credentials
                .as_ref()
                .map(|c| c.username.clone())
                .unwrap_or_default(),
            datacenter: self.datacenter.clone(),
        }
    }
}

/// Cache key of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Server as given by the caller
    pub server: String,
    /// Username the session is authenticated as
    pub username: String,
    /// Datacenter the finder is scoped to (may be empty)
    pub datacenter: String,
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}#{}", self.server, self.username, self.datacenter)
    }
}

/// An authenticated platform session
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    endpoint: Url,
    vim: Option<Arc<dyn VimClient>>,
    tags: Arc<dyn TagClient>,
    datacenter: Option<Datacenter>,
    activity: Notify,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Cache key of this session
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Parsed server endpoint
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Inventory client
    pub fn vim(&self) -> Result<&Arc<dyn VimClient>, VSphereError> {
        self.vim.as_ref().ok_or(VSphereError::NotInitialized)
    }

    /// Tagging client
    pub fn tags(&self) -> &Arc<dyn TagClient> {
        &self.tags
    }

    /// Datacenter the finder is scoped to, if one was requested
    pub fn datacenter(&self) -> Option<&Datacenter> {
        self.datacenter.as_ref()
    }

    /// Find a VM by its SMBIOS UUID within the session's datacenter
    pub async fn find_by_bios_uuid(&self, uuid: &str) -> Result<ManagedObjectReference, VSphereError> {
        self.vim()?.find_by_uuid(self.datacenter(), uuid, false).await
    }

    /// Find a VM by its vCenter instance UUID within the session's datacenter
    pub async fn find_by_instance_uuid(&self, uuid: &str) -> Result<ManagedObjectReference, VSphereError> {
        self.vim()?.find_by_uuid(self.datacenter(), uuid, true).await
    }

    /// Reset the keep-alive idle timer
    fn touch(&self) {
        self.activity.notify_one();
    }

    fn keep_alive_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.keep_alive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Best-effort logout of both sessions and stop the keep-alive task
    async fn shutdown(&self) {
        if let Some(vim) = &self.vim {
            if let Err(e) = vim.logout().await {
                warn!(session = %self.key, error = %e, "Failed to log out vSphere session");
            }
        }
        if let Err(e) = self.tags.logout().await {
            warn!(session = %self.key, error = %e, "Failed to log out tagging session");
        }
        if let Some(handle) = self.keep_alive_slot().take() {
            handle.abort();
        }
    }
}

type Cache = HashMap<SessionKey, Arc<Session>>;

/// Process-wide cache of platform sessions
///
/// Cloning is cheap; all clones share the same cache.
#[derive(Clone)]
pub struct SessionManager {
    connector: Arc<dyn PlatformConnector>,
    cache: Arc<Mutex<Cache>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.cache().len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create an empty cache using `connector` to log in
    pub fn new(connector: Arc<dyn PlatformConnector>) -> Self {
        Self {
            connector,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of cached sessions
    pub fn len(&self) -> usize {
        self.cache().len()
    }

    /// Whether no session is cached
    pub fn is_empty(&self) -> bool {
        self.cache().is_empty()
    }

    /// Return a cached session or log in a new one
    pub async fn get_or_create(&self, params: &Params) -> Result<Arc<Session>, VSphereError> {
        let key = params.key();
        let cached = self.cache().get(&key).cloned();

        if let Some(session) = cached {
            if !params.refresh {
                debug!(session = %key, caller = %params.caller, "Found active cached vSphere session");
                session.touch();
                return Ok(session);
            }
            match session.tags.session_info().await {
                Ok(Some(_)) => {
                    debug!(session = %key, caller = %params.caller, "Cached vSphere session is still active");
                    session.touch();
                    return Ok(session);
                }
                Ok(None) => {
                    info!(session = %key, caller = %params.caller, "Cached vSphere session is no longer active, creating a new one");
                }
                Err(e) => {
                    info!(session = %key, caller = %params.caller, error = %e, "Failed to check cached vSphere session, creating a new one");
                }
            }
        }

        self.clear_cache(&key).await;

        let session = Arc::new(self.create(&key, params).await?);
        if params.feature.enable_keep_alive {
            self.spawn_keep_alive(&session, params.feature.keep_alive_duration);
        }

        let previous = self.cache().insert(key.clone(), Arc::clone(&session));
        if let Some(previous) = previous {
            // A concurrent pass stored a session for the same key first
            if !Arc::ptr_eq(&previous, &session) {
                previous.shutdown().await;
            }
        }

        info!(session = %key, caller = %params.caller, "Created vSphere session");
        Ok(session)
    }

    async fn create(&self, key: &SessionKey, params: &Params) -> Result<Session, VSphereError> {
        let endpoint = parse_endpoint(&params.server)?;
        let credentials = params.credentials.clone().unwrap_or_else(|| Credentials::new("", ""));
        let thumbprint = Some(params.thumbprint.as_str()).filter(|t| !t.is_empty());

        let vim = self.connector.login(&endpoint, &credentials, thumbprint).await?;
        let tags = match self.connector.login_tags(&endpoint, &credentials, thumbprint).await {
            Ok(tags) => tags,
            Err(e) => {
                if let Err(logout) = vim.logout().await {
                    warn!(session = %key, error = %logout, "Failed to log out vSphere session");
                }
                return Err(e);
            }
        };

        let datacenter = if params.datacenter.is_empty() {
            None
        } else {
            match vim.find_datacenter(&params.datacenter).await {
                Ok(dc) => Some(dc),
                Err(e) => {
                    if let Err(logout) = vim.logout().await {
                        warn!(session = %key, error = %logout, "Failed to log out vSphere session");
                    }
                    if let Err(logout) = tags.logout().await {
                        warn!(session = %key, error = %logout, "Failed to log out tagging session");
                    }
                    return Err(e);
                }
            }
        };

        Ok(Session {
            key: key.clone(),
            endpoint,
            vim: Some(vim),
            tags,
            datacenter,
            activity: Notify::new(),
            keep_alive: Mutex::new(None),
        })
    }

    /// Evict the session for `key`, logging it out best-effort
    ///
    /// Idempotent; the entry is removed even if logout fails.
    pub async fn clear_cache(&self, key: &SessionKey) {
        let removed = self.cache().remove(key);
        if let Some(session) = removed {
            debug!(session = %key, "Evicting vSphere session");
            session.shutdown().await;
        }
    }

    /// Evict `key` only if it still maps to `session`
    async fn evict_if_current(&self, key: &SessionKey, session: &Arc<Session>) {
        let removed = {
            let mut cache = self.cache();
            match cache.get(key) {
                Some(current) if Arc::ptr_eq(current, session) => cache.remove(key),
                _ => None,
            }
        };
        if let Some(session) = removed {
            session.shutdown().await;
        }
    }

    fn spawn_keep_alive(&self, session: &Arc<Session>, interval: Duration) {
        let manager = self.clone();
        let weak: Weak<Session> = Arc::downgrade(session);
        let key = session.key.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Some(session) = weak.upgrade() else { return };
                let idle = tokio::select! {
                    () = tokio::time::sleep(interval) => true,
                    () = session.activity.notified() => false,
                };
                if !idle {
                    continue;
                }

                let alive = match session.vim() {
                    Ok(vim) => matches!(vim.session_info().await, Ok(Some(_))),
                    Err(_) => false,
                } && matches!(session.tags.session_info().await, Ok(Some(_)));

                if alive {
                    debug!(session = %key, "Keep-alive round trip succeeded");
                    continue;
                }
                info!(session = %key, "Keep-alive failed, evicting vSphere session");
                manager.evict_if_current(&key, &session).await;
                return;
            }
        });
        *session.keep_alive_slot() = Some(handle);
    }
}

/// Parse a server as a bare host, `host:port` or a full URL
///
/// The scheme defaults to `https`; path and query are dropped.
pub fn parse_endpoint(server: &str) -> Result<Url, VSphereError> {
    let server = server.trim();
    if server.is_empty() {
        return Err(VSphereError::InvalidUrl(server.to_string()));
    }
    let raw = if server.contains("://") {
        server.to_string()
    } else {
        format!("https://{}", server)
    };
    let mut url = Url::parse(&raw).map_err(|_| VSphereError::InvalidUrl(server.to_string()))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(VSphereError::InvalidUrl(server.to_string()));
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
