// Hetzner Cloud reverse DNS
//
// An address is looked up across servers, primary IPs, floating IPs and
// load balancers, in that order. The PTR change is an asynchronous action
// that is polled until it settles.

use crate::{http_client, status_error};
use async_trait::async_trait;
use maildns_core::traits::PtrProvider;
use maildns_core::{Error, Result};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::Mutex;

/// Hetzner Cloud API base URL
pub const HETZNER_CLOUD_API_BASE: &str = "https://api.hetzner.cloud/v1";

const ACTION_TIMEOUT: Duration = Duration::from_secs(60);
const ACTION_POLL_INTERVAL: Duration = Duration::from_secs(2);
const PAGE_SIZE: u32 = 50;

/// Resource kind an address is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpKind {
    Server,
    PrimaryIp,
    FloatingIp,
    LoadBalancer,
}

impl IpKind {
    /// API collection path for the kind
    fn collection(&self) -> &'static str {
        match self {
            IpKind::Server => "servers",
            IpKind::PrimaryIp => "primary_ips",
            IpKind::FloatingIp => "floating_ips",
            IpKind::LoadBalancer => "load_balancers",
        }
    }
}

impl fmt::Display for IpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// Where an address lives and what it currently points to
#[derive(Debug, Clone, PartialEq, Eq)]
struct IpLocation {
    kind: IpKind,
    resource_id: u64,
    current_ptr: Option<String>,
}

/// Hetzner Cloud PTR provider
///
/// Lookups are cached per address until the PTR is changed.
pub struct HetznerCloudPtr {
    /// ⚠️ NEVER log this value
    api_token: String,
    api_base: String,
    client: reqwest::Client,
    action_timeout: Duration,
    action_poll_interval: Duration,
    locations: Mutex<HashMap<IpAddr, IpLocation>>,
}

impl fmt::Debug for HetznerCloudPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HetznerCloudPtr")
            .field("api_token", &"<REDACTED>")
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    next_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    meta: Option<Meta>,
    #[serde(flatten)]
    items: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PublicIpv4 {
    ip: String,
    #[serde(default)]
    dns_ptr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PublicNet {
    #[serde(default)]
    ipv4: Option<PublicIpv4>,
}

/// Servers and load balancers carry their address under `public_net`
#[derive(Debug, Deserialize)]
struct NetworkedResource {
    id: u64,
    public_net: PublicNet,
}

#[derive(Debug, Deserialize)]
struct DnsPtrEntry {
    ip: String,
    dns_ptr: String,
}

/// Primary and floating IPs are addresses in their own right
#[derive(Debug, Deserialize)]
struct AddressResource {
    id: u64,
    ip: String,
    #[serde(default)]
    dns_ptr: Vec<DnsPtrEntry>,
}

#[derive(Debug, Serialize)]
struct ChangeDnsPtr<'a> {
    ip: String,
    dns_ptr: &'a str,
}

#[derive(Debug, Deserialize)]
struct ActionEnvelope {
    action: Action,
}

#[derive(Debug, Deserialize)]
struct Action {
    id: u64,
    status: String,
    #[serde(default)]
    error: Option<ActionError>,
}

#[derive(Debug, Deserialize)]
struct ActionError {
    #[serde(default)]
    message: String,
}

impl HetznerCloudPtr {
    /// Create a provider for a project API token
    pub fn new(api_token: impl Into<String>) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.trim().is_empty() {
            return Err(Error::config("Hetzner Cloud API token cannot be empty"));
        }

        Ok(Self {
            api_token,
            api_base: HETZNER_CLOUD_API_BASE.to_string(),
            client: http_client()?,
            action_timeout: ACTION_TIMEOUT,
            action_poll_interval: ACTION_POLL_INTERVAL,
            locations: Mutex::new(HashMap::new()),
        })
    }

    /// Point the provider at another API base
    pub fn with_base_url(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Override how long PTR change actions are polled
    pub fn with_action_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.action_timeout = timeout;
        self.action_poll_interval = poll_interval;
        self
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&ChangeDnsPtr<'_>>,
    ) -> Result<T> {
        let url = format!("{}{}", self.api_base, path);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::http(format!("Hetzner Cloud request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("Hetzner Cloud", status, &body));
        }

        response.json().await.map_err(|e| {
            Error::ptr_provider(format!("Failed to parse Hetzner Cloud response: {}", e))
        })
    }

    /// Every item of a paginated collection
    async fn list_all<T: DeserializeOwned>(&self, kind: IpKind) -> Result<Vec<T>> {
        let path = format!("/{}", kind.collection());
        let mut items = Vec::new();
        let mut page = 1;

        loop {
            let mut response: Page = self
                .request(
                    Method::GET,
                    &path,
                    &[("page", page.to_string()), ("per_page", PAGE_SIZE.to_string())],
                    None,
                )
                .await?;

            if let Some(value) = response.items.remove(kind.collection()) {
                let batch: Vec<T> = serde_json::from_value(value)?;
                items.extend(batch);
            }

            match response.meta.and_then(|m| m.pagination.next_page) {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        Ok(items)
    }

    /// Search servers or load balancers by their public IPv4
    async fn find_networked(&self, kind: IpKind, wanted: &str) -> Result<Option<IpLocation>> {
        let resources: Vec<NetworkedResource> = self.list_all(kind).await?;
        Ok(resources.into_iter().find_map(|r| {
            let ipv4 = r.public_net.ipv4.filter(|v4| v4.ip == wanted)?;
            Some(IpLocation {
                kind,
                resource_id: r.id,
                // Load balancer PTRs are managed outside the API.
                current_ptr: ipv4.dns_ptr.filter(|_| kind == IpKind::Server),
            })
        }))
    }

    /// Search primary or floating IPs
    async fn find_address(&self, kind: IpKind, wanted: &str) -> Result<Option<IpLocation>> {
        let addresses: Vec<AddressResource> = self.list_all(kind).await?;
        Ok(addresses.into_iter().find(|a| a.ip == wanted).map(|a| IpLocation {
            kind,
            resource_id: a.id,
            current_ptr: a
                .dns_ptr
                .into_iter()
                .find(|p| p.ip == wanted)
                .map(|p| p.dns_ptr),
        }))
    }

    async fn locate(&self, ip: IpAddr) -> Result<Option<IpLocation>> {
        if let Some(location) = self.locations.lock().await.get(&ip) {
            return Ok(Some(location.clone()));
        }

        tracing::debug!("Searching Hetzner Cloud for {}", ip);
        let wanted = ip.to_string();

        let mut location = self.find_networked(IpKind::Server, &wanted).await?;
        if location.is_none() {
            location = self.find_address(IpKind::PrimaryIp, &wanted).await?;
        }
        if location.is_none() {
            location = self.find_address(IpKind::FloatingIp, &wanted).await?;
        }
        if location.is_none() {
            location = self.find_networked(IpKind::LoadBalancer, &wanted).await?;
        }

        if let Some(location) = &location {
            tracing::debug!(
                "Found {} on {} {} (ptr: {:?})",
                ip,
                location.kind,
                location.resource_id,
                location.current_ptr
            );
            self.locations.lock().await.insert(ip, location.clone());
        }
        Ok(location)
    }

    async fn wait_for_action(&self, action_id: u64) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.action_timeout;

        loop {
            let envelope: ActionEnvelope = self
                .request(Method::GET, &format!("/actions/{}", action_id), &[], None)
                .await?;

            match envelope.action.status.as_str() {
                "success" => return Ok(()),
                "error" => {
                    let message = envelope
                        .action
                        .error
                        .map(|e| e.message)
                        .unwrap_or_default();
                    return Err(Error::ptr_provider(format!(
                        "Hetzner action {} failed: {}",
                        action_id, message
                    )));
                }
                _ => {}
            }

            if tokio::time::Instant::now() + self.action_poll_interval > deadline {
                return Err(Error::ptr_provider(format!(
                    "Hetzner action {} timed out after {:?}",
                    action_id, self.action_timeout
                )));
            }
            tokio::time::sleep(self.action_poll_interval).await;
        }
    }
}

#[async_trait]
impl PtrProvider for HetznerCloudPtr {
    async fn get_ptr(&self, ip: IpAddr) -> Result<Option<String>> {
        Ok(self.locate(ip).await?.and_then(|l| l.current_ptr))
    }

    async fn set_ptr(&self, ip: IpAddr, hostname: &str) -> Result<()> {
        let location = self
            .locate(ip)
            .await?
            .ok_or_else(|| Error::not_found(format!("IP {} not found in Hetzner Cloud", ip)))?;

        if location.kind == IpKind::LoadBalancer {
            return Err(Error::ptr_provider(format!(
                "PTR of load balancer address {} cannot be changed via the API; \
                 use the load-balancer.hetzner.cloud/hostname annotation",
                ip
            )));
        }

        let path = format!(
            "/{}/{}/actions/change_dns_ptr",
            location.kind.collection(),
            location.resource_id
        );
        let body = ChangeDnsPtr {
            ip: ip.to_string(),
            dns_ptr: hostname,
        };
        let envelope: ActionEnvelope = self.request(Method::POST, &path, &[], Some(&body)).await?;

        let result = self.wait_for_action(envelope.action.id).await;
        self.locations.lock().await.remove(&ip);
        result?;

        tracing::info!("PTR set: {} -> {}", ip, hostname);
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "hetzner-cloud"
    }
}
