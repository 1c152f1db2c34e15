// # Cloudflare DNS Provider
//
// Cloudflare API v4 implementation of the primitive `DnsProvider` contract.
//
// ## Scope
//
// - Zone discovery by walking the domain upward, with a per-instance cache
// - Paginated record listing (`per_page=100`)
// - Create, replace and delete by record id
//
// Ownership markers, dry-run and retries live in `maildns-core`; this crate
// performs exactly the HTTP calls it is asked for.
//
// ## Security Requirements
//
// - API token NEVER appears in logs or Debug output
// - Construction fails if the token is empty
//
// ## API Reference
//
// - List Zones: GET `/zones?name=...&status=active`
// - List DNS Records: GET `/zones/:zone_id/dns_records?per_page=100&page=N`
// - Create DNS Record: POST `/zones/:zone_id/dns_records`
// - Update DNS Record: PUT `/zones/:zone_id/dns_records/:record_id`
// - Delete DNS Record: DELETE `/zones/:zone_id/dns_records/:record_id`
// - Verify Token: GET `/user/tokens/verify`

use async_trait::async_trait;
use maildns_core::config::ProviderSettings;
use maildns_core::record::{DnsRecord, RecordType, normalize_name, unquote_txt, zone_candidates};
use maildns_core::registry::ProviderRegistry;
use maildns_core::traits::DnsProvider;
use maildns_core::{Error, Result};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Cloudflare API base URL
pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Records requested per listing page
const PAGE_SIZE: u32 = 100;

/// Cloudflare DNS provider
///
/// # Zone Resolution
///
/// Pre-configured `domain → zone id` pairs are consulted first. Otherwise
/// each candidate from the domain upward is looked up; hits are cached
/// for the lifetime of the instance.
///
/// # Security
///
/// The Debug implementation does NOT expose the API token.
pub struct CloudflareProvider {
    /// Cloudflare API token
    /// ⚠️ NEVER log this value
    api_token: String,

    /// API base URL
    api_base: String,

    /// Pre-configured zone ids, keyed by domain
    zone_ids: HashMap<String, String>,

    /// Zone ids discovered through the API
    zone_cache: RwLock<HashMap<String, String>>,

    /// Proxy eligible records through Cloudflare
    proxied: bool,

    /// HTTP client for API requests
    client: reqwest::Client,
}

// Custom Debug implementation that hides the API token
impl std::fmt::Debug for CloudflareProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareProvider")
            .field("api_token", &"<REDACTED>")
            .field("api_base", &self.api_base)
            .field("zone_ids", &self.zone_ids)
            .field("proxied", &self.proxied)
            .finish()
    }
}

/// Response envelope shared by every Cloudflare v4 endpoint
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default = "default_total_pages")]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    content: String,
    #[serde(default = "default_api_ttl")]
    ttl: u32,
    #[serde(default)]
    priority: Option<u16>,
    #[serde(default)]
    proxied: bool,
}

#[derive(Debug, Serialize)]
struct RecordPayload<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxied: Option<bool>,
}

fn default_total_pages() -> u32 {
    1
}

fn default_api_ttl() -> u32 {
    1
}

impl CloudflareProvider {
    /// Create a new Cloudflare provider
    ///
    /// # Parameters
    ///
    /// - `api_token`: Cloudflare API token with Zone:Read and DNS:Edit permissions
    /// - `zone_ids`: Pre-configured zone ids, keyed by domain
    /// - `proxied`: Proxy A/CNAME records through Cloudflare
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty token or when the HTTP
    /// client cannot be built.
    pub fn new(
        api_token: impl Into<String>,
        zone_ids: HashMap<String, String>,
        proxied: bool,
    ) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.trim().is_empty() {
            return Err(Error::config("Cloudflare API token cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        let zone_ids = zone_ids
            .into_iter()
            .map(|(domain, zone)| (normalize_name(&domain).to_ascii_lowercase(), zone))
            .collect();

        Ok(Self {
            api_token,
            api_base: CLOUDFLARE_API_BASE.to_string(),
            zone_ids,
            zone_cache: RwLock::new(HashMap::new()),
            proxied,
            client,
        })
    }

    /// Point the provider at another API base (tests, API gateways)
    pub fn with_base_url(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Build a provider from registry settings
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let ProviderSettings::Cloudflare {
            api_token,
            zone_ids,
            proxied,
            api_base,
        } = settings;

        let provider = Self::new(api_token.clone(), zone_ids.clone(), *proxied)?;
        Ok(match api_base {
            Some(base) => provider.with_base_url(base.clone()),
            None => provider,
        })
    }

    /// Check that the token is valid and active
    pub async fn verify_token(&self) -> Result<()> {
        let _: Envelope<serde_json::Value> = self
            .request(Method::GET, "/user/tokens/verify", &[], None)
            .await?;
        tracing::debug!("Cloudflare API token verified");
        Ok(())
    }

    /// Perform one API call and unwrap the envelope
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&RecordPayload<'_>>,
    ) -> Result<Envelope<T>> {
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
            .map_err(|e| Error::http(format!("Cloudflare request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(status_error(status, &error_text));
        }

        let envelope: Envelope<T> = response.json().await.map_err(|e| {
            Error::provider("cloudflare", format!("Failed to parse response: {}", e))
        })?;

        if !envelope.success {
            return Err(Error::provider("cloudflare", describe_errors(&envelope.errors)));
        }
        Ok(envelope)
    }

    fn configured_zone(&self, candidates: &[String]) -> Option<String> {
        candidates
            .iter()
            .find_map(|candidate| self.zone_ids.get(candidate).cloned())
    }

    fn payload<'a>(&self, record: &'a DnsRecord) -> RecordPayload<'a> {
        RecordPayload {
            record_type: record.record_type.as_str(),
            name: &record.name,
            content: &record.content,
            ttl: record.ttl.max(1),
            priority: match record.record_type {
                RecordType::Mx => record.priority,
                _ => None,
            },
            proxied: record
                .record_type
                .supports_proxy()
                .then_some(self.proxied && record.proxied),
        }
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    async fn resolve_zone(&self, domain: &str) -> Result<Option<String>> {
        let domain = normalize_name(domain).to_ascii_lowercase();
        let candidates = zone_candidates(&domain);

        if let Some(zone_id) = self.configured_zone(&candidates) {
            tracing::debug!("Using pre-configured zone for {}", domain);
            return Ok(Some(zone_id));
        }

        if let Some(zone_id) = self.zone_cache.read().await.get(&domain) {
            return Ok(Some(zone_id.clone()));
        }

        for candidate in &candidates {
            let envelope: Envelope<Vec<Zone>> = self
                .request(
                    Method::GET,
                    "/zones",
                    &[("name", candidate.clone()), ("status", "active".to_string())],
                    None,
                )
                .await?;

            if let Some(zone) = envelope.result.unwrap_or_default().into_iter().next() {
                tracing::debug!("Found zone {} for {}", candidate, domain);
                let mut cache = self.zone_cache.write().await;
                cache.insert(domain.clone(), zone.id.clone());
                cache.insert(candidate.clone(), zone.id.clone());
                return Ok(Some(zone.id));
            }
        }

        tracing::warn!("No Cloudflare zone found for {}", domain);
        Ok(None)
    }

    async fn list_records(
        &self,
        zone_id: &str,
        record_type: Option<RecordType>,
        name: Option<&str>,
    ) -> Result<Vec<DnsRecord>> {
        let path = format!("/zones/{}/dns_records", zone_id);
        let mut records = Vec::new();
        let mut page: u32 = 1;

        loop {
            let mut query = vec![("per_page", PAGE_SIZE.to_string()), ("page", page.to_string())];
            if let Some(record_type) = record_type {
                query.push(("type", record_type.as_str().to_string()));
            }
            if let Some(name) = name {
                query.push(("name", normalize_name(name)));
            }

            let envelope: Envelope<Vec<ApiRecord>> =
                self.request(Method::GET, &path, &query, None).await?;
            let total_pages = envelope
                .result_info
                .as_ref()
                .map(|info| info.total_pages)
                .unwrap_or(1);

            records.extend(
                envelope
                    .result
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(into_record),
            );

            if page >= total_pages {
                break;
            }
            page += 1;
        }

        Ok(records)
    }

    async fn create_record(&self, zone_id: &str, record: &DnsRecord) -> Result<String> {
        let path = format!("/zones/{}/dns_records", zone_id);
        let envelope: Envelope<ApiRecord> = self
            .request(Method::POST, &path, &[], Some(&self.payload(record)))
            .await?;

        let created = envelope.result.ok_or_else(|| {
            Error::provider("cloudflare", "Create succeeded without returning a record")
        })?;
        tracing::debug!("Created {} (id: {})", record, created.id);
        Ok(created.id)
    }

    async fn update_record(&self, zone_id: &str, record: &DnsRecord) -> Result<()> {
        let record_id = record
            .provider_id
            .as_deref()
            .ok_or_else(|| Error::invalid_input(format!("{} has no record id", record)))?;

        let path = format!("/zones/{}/dns_records/{}", zone_id, record_id);
        let _: Envelope<ApiRecord> = self
            .request(Method::PUT, &path, &[], Some(&self.payload(record)))
            .await?;
        Ok(())
    }

    async fn delete_record(&self, zone_id: &str, provider_id: &str) -> Result<()> {
        let path = format!("/zones/{}/dns_records/{}", zone_id, provider_id);
        let _: Envelope<serde_json::Value> =
            self.request(Method::DELETE, &path, &[], None).await?;
        Ok(())
    }

    async fn verify_credentials(&self) -> Result<()> {
        self.verify_token().await
    }

    fn provider_name(&self) -> &'static str {
        "cloudflare"
    }
}

fn into_record(api: ApiRecord) -> Option<DnsRecord> {
    let record_type = match api.record_type.parse::<RecordType>() {
        Ok(record_type) => record_type,
        Err(_) => {
            tracing::trace!("Skipping unsupported record type {}", api.record_type);
            return None;
        }
    };

    let content = match record_type {
        RecordType::Txt => unquote_txt(&api.content).to_string(),
        _ => api.content,
    };

    let mut record = DnsRecord::new(&api.name, record_type, content)
        .with_ttl(api.ttl)
        .with_proxied(api.proxied)
        .with_provider_id(api.id);
    if let Some(priority) = api.priority {
        record = record.with_priority(priority);
    }
    Some(record)
}

/// Map a non-success HTTP status to an error
fn status_error(status: StatusCode, body: &str) -> Error {
    match status.as_u16() {
        401 | 403 => Error::auth(format!(
            "Invalid API token or insufficient permissions. Status: {}",
            status
        )),
        404 => Error::not_found(format!("Cloudflare resource not found: {}", body)),
        429 => Error::rate_limited(format!("Cloudflare rate limit exceeded. Status: {}", status)),
        500..=599 => Error::http(format!(
            "Cloudflare server error (transient): {} - {}",
            status, body
        )),
        _ => Error::provider("cloudflare", format!("{} - {}", status, body)),
    }
}

fn describe_errors(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "request failed without error details".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Factory function for the provider registry
pub fn create_provider(settings: &ProviderSettings) -> Result<Arc<dyn DnsProvider>> {
    Ok(Arc::new(CloudflareProvider::from_settings(settings)?))
}

/// Register the Cloudflare provider with a registry
///
/// # Example
///
/// ```rust
/// use maildns_core::ProviderRegistry;
///
/// let mut registry = ProviderRegistry::new();
/// maildns_provider_cloudflare::register(&mut registry);
/// assert!(registry.has_provider("cloudflare"));
/// ```
pub fn register(registry: &mut ProviderRegistry) {
    registry.register_provider("cloudflare", Box::new(create_provider));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> CloudflareProvider {
        CloudflareProvider::new("test_token", HashMap::new(), false).unwrap()
    }

    #[test]
    fn test_empty_token_is_rejected() {
        let err = CloudflareProvider::new("  ", HashMap::new(), false).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_api_token_not_exposed_in_debug() {
        let provider = CloudflareProvider::new("secret_token_12345", HashMap::new(), false).unwrap();

        let debug_str = format!("{:?}", provider);
        assert!(!debug_str.contains("secret_token"));
        assert!(debug_str.contains("CloudflareProvider"));
    }

    #[test]
    fn test_payload_sends_priority_only_for_mx() {
        let provider = provider();
        let mx = DnsRecord::new("ex.com", RecordType::Mx, "mail.ex.com").with_priority(10);
        let txt = DnsRecord::new("ex.com", RecordType::Txt, "v=spf1 -all").with_priority(10);

        let mx_json = serde_json::to_value(provider.payload(&mx)).unwrap();
        let txt_json = serde_json::to_value(provider.payload(&txt)).unwrap();

        assert_eq!(mx_json["priority"], 10);
        assert!(txt_json.get("priority").is_none());
        assert!(txt_json.get("proxied").is_none());
    }

    #[test]
    fn test_payload_proxied_requires_both_switches() {
        let record = DnsRecord::new("mail.ex.com", RecordType::A, "1.2.3.4").with_proxied(true);

        let off = provider();
        assert_eq!(serde_json::to_value(off.payload(&record)).unwrap()["proxied"], false);

        let on = CloudflareProvider::new("t", HashMap::new(), true).unwrap();
        assert_eq!(serde_json::to_value(on.payload(&record)).unwrap()["proxied"], true);

        let plain = DnsRecord::new("mail.ex.com", RecordType::A, "1.2.3.4");
        assert_eq!(serde_json::to_value(on.payload(&plain)).unwrap()["proxied"], false);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, ""),
            Error::Authentication(_)
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, ""),
            Error::RateLimited(_)
        ));
        assert!(status_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(
            status_error(StatusCode::CONFLICT, "dup"),
            Error::Provider { .. }
        ));
    }

    #[test]
    fn test_from_settings_applies_base_url() {
        let settings = ProviderSettings::Cloudflare {
            api_token: "token".to_string(),
            zone_ids: HashMap::new(),
            proxied: true,
            api_base: Some("http://localhost:8080/".to_string()),
        };
        let provider = CloudflareProvider::from_settings(&settings).unwrap();
        assert_eq!(provider.api_base, "http://localhost:8080");
        assert!(provider.proxied);

        let empty = ProviderSettings::Cloudflare {
            api_token: " ".to_string(),
            zone_ids: HashMap::new(),
            proxied: false,
            api_base: None,
        };
        assert!(create_provider(&empty).is_err());
    }

    #[test]
    fn test_registration() {
        let mut registry = ProviderRegistry::new();
        register(&mut registry);
        assert!(registry.has_provider("Cloudflare"));
    }
}
