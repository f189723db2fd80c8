//! vSphere Automation REST client
//!
//! Implements the connector traits against the `/api` surface of vCenter 7
//! and later. Every authenticated request carries the session token in the
//! `vmware-api-session-id` header.

use crate::error::VSphereError;
use crate::models::*;
use crate::platform_trait::{PlatformConnector, TagClient, VimClient};
use crate::tls::pinned_client_config;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Header carrying the session token
pub const SESSION_HEADER: &str = "vmware-api-session-id";

/// Default `User-Agent` for platform requests
pub const DEFAULT_USER_AGENT: &str = "vsphere-controller/infrastructure.cluster.x-k8s.io-v1beta1";

/// Creates REST sessions against vCenter
#[derive(Debug, Clone)]
pub struct RestConnector {
    user_agent: String,
    timeout: Duration,
}

impl Default for RestConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RestConnector {
    /// Connector with the default user agent and a 30s request timeout
    pub fn new() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Override the `User-Agent` header
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// HTTP client pinned to `thumbprint`, or accepting any certificate
    fn http_client(&self, thumbprint: Option<&str>) -> Result<Client, VSphereError> {
        let builder = Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone());
        let builder = match thumbprint {
            Some(thumbprint) => builder.use_preconfigured_tls(pinned_client_config(thumbprint)?),
            None => builder.danger_accept_invalid_certs(true),
        };
        Ok(builder.build()?)
    }

    async fn create_session(
        &self,
        endpoint: &Url,
        credentials: &Credentials,
        thumbprint: Option<&str>,
    ) -> Result<RestSession, VSphereError> {
        let http = self.http_client(thumbprint)?;
        let url = join(endpoint, "api/session")?;
        debug!(server = %endpoint, username = %credentials.username, "Creating vSphere API session");

        let response = http
            .post(url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(VSphereError::Authentication(format!(
                "login as {} rejected: {}",
                credentials.username, status
            )));
        }
        let response = check(response).await?;
        let token: String = response.json().await?;

        Ok(RestSession {
            http,
            base: endpoint.clone(),
            token,
        })
    }
}

#[async_trait::async_trait]
impl PlatformConnector for RestConnector {
    async fn login(
        &self,
        endpoint: &Url,
        credentials: &Credentials,
        thumbprint: Option<&str>,
    ) -> Result<Arc<dyn VimClient>, VSphereError> {
        let session = self.create_session(endpoint, credentials, thumbprint).await?;
        Ok(Arc::new(RestVimClient { session }))
    }

    async fn login_tags(
        &self,
        endpoint: &Url,
        credentials: &Credentials,
        thumbprint: Option<&str>,
    ) -> Result<Arc<dyn TagClient>, VSphereError> {
        let session = self.create_session(endpoint, credentials, thumbprint).await?;
        Ok(Arc::new(RestTagClient { session }))
    }
}

fn join(base: &Url, path: &str) -> Result<Url, VSphereError> {
    base.join(path)
        .map_err(|e| VSphereError::InvalidUrl(format!("{}{}: {}", base, path, e)))
}

/// Map a non-success response onto an error
async fn check(response: Response) -> Result<Response, VSphereError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Err(VSphereError::NotFound(url)),
        StatusCode::UNAUTHORIZED => Err(VSphereError::Authentication(format!("{} - {}", status, body))),
        _ => Err(VSphereError::Api(format!("{} {} - {}", url, status, body))),
    }
}

/// An authenticated API session
struct RestSession {
    http: Client,
    base: Url,
    token: String,
}

impl std::fmt::Debug for RestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestSession")
            .field("base", &self.base.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

impl RestSession {
    fn url(&self, path: &str) -> Result<Url, VSphereError> {
        join(&self.base, path)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(SESSION_HEADER, &self.token)
            .header("Accept", "application/json")
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, VSphereError> {
        debug!(url = %url, "GET");
        let response = check(self.request(Method::GET, url).send().await?).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn session_info(&self) -> Result<Option<SessionInfo>, VSphereError> {
        let response = self.request(Method::GET, self.url("api/session")?).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let response = check(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn logout(&self) -> Result<(), VSphereError> {
        let response = self.request(Method::DELETE, self.url("api/session")?).send().await?;
        // An already expired session is as good as a logged out one
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    /// Resolve an inventory name to an identifier via a `?names=` list call
    async fn lookup_id(&self, collection: &str, id_field: &str, name: &str) -> Result<String, VSphereError> {
        let mut url = self.url(&format!("api/vcenter/{}", collection))?;
        url.query_pairs_mut().append_pair("names", name);
        let items: Vec<serde_json::Value> = self.get_json(url).await?;
        items
            .first()
            .and_then(|item| item.get(id_field))
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| VSphereError::NotFound(format!("{} {:?}", collection, name)))
    }

    async fn list_vms(&self, datacenter: Option<&Datacenter>, name: Option<&str>) -> Result<Vec<VmSummary>, VSphereError> {
        let mut url = self.url("api/vcenter/vm")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(dc) = datacenter {
                query.append_pair("datacenters", &dc.reference.value);
            }
            if let Some(name) = name {
                query.append_pair("names", name);
            }
        }
        self.get_json(url).await
    }
}

fn vm_path(vm: &ManagedObjectReference, suffix: &str) -> String {
    format!("api/vcenter/vm/{}{}", urlencoding::encode(&vm.value), suffix)
}

/// Inventory and VM client over REST
#[derive(Debug)]
pub struct RestVimClient {
    session: RestSession,
}

impl RestVimClient {
    async fn power(&self, vm: &ManagedObjectReference, action: &str) -> Result<(), VSphereError> {
        let mut url = self.session.url(&vm_path(vm, "/power"))?;
        url.query_pairs_mut().append_pair("action", action);
        debug!(vm = %vm, action, "Changing power state");
        check(self.session.request(Method::POST, url).send().await?).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl VimClient for RestVimClient {
    async fn session_info(&self) -> Result<Option<SessionInfo>, VSphereError> {
        self.session.session_info().await
    }

    async fn logout(&self) -> Result<(), VSphereError> {
        self.session.logout().await
    }

    async fn version(&self) -> Result<ApplianceVersion, VSphereError> {
        self.session
            .get_json(self.session.url("api/appliance/system/version")?)
            .await
    }

    async fn find_datacenter(&self, name: &str) -> Result<Datacenter, VSphereError> {
        let id = self.session.lookup_id("datacenter", "datacenter", name).await?;
        Ok(Datacenter {
            name: name.to_string(),
            reference: ManagedObjectReference::datacenter(id),
        })
    }

    async fn find_by_uuid(
        &self,
        datacenter: Option<&Datacenter>,
        uuid: &str,
        instance_uuid: bool,
    ) -> Result<ManagedObjectReference, VSphereError> {
        // The REST surface has no UUID filter; walk the VM list and compare identities
        for summary in self.session.list_vms(datacenter, None).await? {
            let vm = ManagedObjectReference::vm(summary.vm);
            let info = match self.vm_info(&vm).await {
                Ok(info) => info,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let Some(identity) = info.identity else { continue };
            let candidate = if instance_uuid {
                &identity.instance_uuid
            } else {
                &identity.bios_uuid
            };
            if candidate.eq_ignore_ascii_case(uuid) {
                return Ok(vm);
            }
        }
        Err(VSphereError::NotFound(format!("vm with uuid {}", uuid)))
    }

    async fn find_vm_by_name(
        &self,
        datacenter: Option<&Datacenter>,
        name: &str,
    ) -> Result<Option<ManagedObjectReference>, VSphereError> {
        Ok(self
            .session
            .list_vms(datacenter, Some(name))
            .await?
            .into_iter()
            .next()
            .map(|summary| ManagedObjectReference::vm(summary.vm)))
    }

    async fn vm_info(&self, vm: &ManagedObjectReference) -> Result<VmInfo, VSphereError> {
        self.session.get_json(self.session.url(&vm_path(vm, ""))?).await
    }

    async fn guest_interfaces(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<Vec<GuestInterface>, VSphereError> {
        let url = self.session.url(&vm_path(vm, "/guest/networking/interfaces"))?;
        let response = self.session.request(Method::GET, url).send().await?;
        // VMware Tools not running yet
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(Vec::new());
        }
        Ok(check(response).await?.json().await?)
    }

    async fn clone_vm(&self, request: &CloneRequest) -> Result<ManagedObjectReference, VSphereError> {
        let source = self
            .find_vm_by_name(request.datacenter.as_ref(), &request.template)
            .await?
            .ok_or_else(|| VSphereError::NotFound(format!("template {:?}", request.template)))?;

        let mut placement = serde_json::Map::new();
        if let Some(folder) = &request.folder {
            let id = self.session.lookup_id("folder", "folder", folder).await?;
            placement.insert("folder".to_string(), id.into());
        }
        if let Some(datastore) = &request.datastore {
            let id = self.session.lookup_id("datastore", "datastore", datastore).await?;
            placement.insert("datastore".to_string(), id.into());
        }
        if let Some(pool) = &request.resource_pool {
            let id = self.session.lookup_id("resource-pool", "resource_pool", pool).await?;
            placement.insert("resource_pool".to_string(), id.into());
        }

        let body = serde_json::json!({
            "name": request.name,
            "source": source.value,
            "placement": placement,
            "power_on": false,
        });

        let mut url = self.session.url("api/vcenter/vm")?;
        url.query_pairs_mut().append_pair("action", "clone");
        debug!(name = %request.name, template = %request.template, "Cloning VM");
        let response = check(self.session.request(Method::POST, url).json(&body).send().await?).await?;
        let id: String = response.json().await?;
        Ok(ManagedObjectReference::vm(id))
    }

    async fn power_on(&self, vm: &ManagedObjectReference) -> Result<(), VSphereError> {
        self.power(vm, "start").await
    }

    async fn power_off(&self, vm: &ManagedObjectReference) -> Result<(), VSphereError> {
        self.power(vm, "stop").await
    }

    async fn delete_vm(&self, vm: &ManagedObjectReference) -> Result<(), VSphereError> {
        let url = self.session.url(&vm_path(vm, ""))?;
        debug!(vm = %vm, "Deleting VM");
        check(self.session.request(Method::DELETE, url).send().await?).await?;
        Ok(())
    }
}

/// Tagging API session over REST
#[derive(Debug)]
pub struct RestTagClient {
    session: RestSession,
}

#[async_trait::async_trait]
impl TagClient for RestTagClient {
    async fn session_info(&self) -> Result<Option<SessionInfo>, VSphereError> {
        self.session.session_info().await
    }

    async fn logout(&self) -> Result<(), VSphereError> {
        self.session.logout().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_path_encodes_identifier() {
        let vm = ManagedObjectReference::vm("vm-42");
        assert_eq!(vm_path(&vm, "/power"), "api/vcenter/vm/vm-42/power");
        let odd = ManagedObjectReference::vm("vm 1");
        assert_eq!(vm_path(&odd, ""), "api/vcenter/vm/vm%201");
    }

    #[test]
    fn test_http_client_rejects_bad_thumbprint() {
        let connector = RestConnector::new();
        assert!(connector.http_client(Some("not-a-thumbprint")).is_err());
        assert!(connector.http_client(None).is_ok());
    }
}
