// Hetzner Robot reverse DNS (dedicated servers)
//
// Webservice credentials, not a Cloud token. `GET /rdns/{ip}` answers 404
// when no PTR is set.

use crate::{http_client, status_error};
use async_trait::async_trait;
use maildns_core::traits::PtrProvider;
use maildns_core::{Error, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;

/// Hetzner Robot webservice base URL
pub const HETZNER_ROBOT_API_BASE: &str = "https://robot-ws.your-server.de";

/// Hetzner Robot PTR provider
pub struct HetznerRobotPtr {
    username: String,
    /// ⚠️ NEVER log this value
    password: String,
    api_base: String,
    client: reqwest::Client,
}

impl fmt::Debug for HetznerRobotPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HetznerRobotPtr")
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct RdnsEnvelope {
    rdns: Rdns,
}

#[derive(Debug, Deserialize)]
struct Rdns {
    #[serde(default)]
    ptr: Option<String>,
}

impl HetznerRobotPtr {
    /// Create a provider for webservice credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let username = username.into();
        let password = password.into();
        if username.is_empty() || password.is_empty() {
            return Err(Error::config(
                "Hetzner Robot username and password are required",
            ));
        }

        Ok(Self {
            username,
            password,
            api_base: HETZNER_ROBOT_API_BASE.to_string(),
            client: http_client()?,
        })
    }

    /// Point the provider at another webservice base
    pub fn with_base_url(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn rdns_url(&self, ip: IpAddr) -> String {
        format!("{}/rdns/{}", self.api_base, ip)
    }
}

#[async_trait]
impl PtrProvider for HetznerRobotPtr {
    async fn get_ptr(&self, ip: IpAddr) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.rdns_url(ip))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::http(format!("Hetzner Robot request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("Hetzner Robot", status, &body));
        }

        let envelope: RdnsEnvelope = response.json().await.map_err(|e| {
            Error::ptr_provider(format!("Failed to parse Hetzner Robot response: {}", e))
        })?;
        Ok(envelope.rdns.ptr.filter(|ptr| !ptr.is_empty()))
    }

    async fn set_ptr(&self, ip: IpAddr, hostname: &str) -> Result<()> {
        let response = self
            .client
            .post(self.rdns_url(ip))
            .basic_auth(&self.username, Some(&self.password))
            .form(&[("ptr", hostname)])
            .send()
            .await
            .map_err(|e| Error::http(format!("Hetzner Robot request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("Hetzner Robot", status, &body));
        }

        tracing::info!("PTR set: {} -> {}", ip, hostname);
        Ok(())
    }

    /// Check the credentials against the server list
    async fn verify_credentials(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/server", self.api_base))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::http(format!("Hetzner Robot request failed: {}", e)))?;

        let status = response.status();
        // A Robot account without servers answers 404 on the list.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error("Hetzner Robot", status, &body))
    }

    fn provider_name(&self) -> &'static str {
        "hetzner-robot"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // base64("user:pass")
    const BASIC_AUTH: &str = "Basic dXNlcjpwYXNz";

    fn create_mock_provider(mock_server: &MockServer) -> HetznerRobotPtr {
        HetznerRobotPtr::new("user", "pass")
            .unwrap()
            .with_base_url(mock_server.uri())
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_credentials_required() {
        assert!(HetznerRobotPtr::new("user", "").is_err());
        let provider = HetznerRobotPtr::new("user", "hunter2").unwrap();
        assert!(!format!("{:?}", provider).contains("hunter2"));
    }

    #[tokio::test]
    async fn test_get_ptr() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rdns/5.6.7.8"))
            .and(header("Authorization", BASIC_AUTH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "rdns": {"ip": "5.6.7.8", "ptr": "mail.ex.com"}
            })))
            .mount(&mock_server)
            .await;

        let provider = create_mock_provider(&mock_server);
        assert_eq!(
            provider.get_ptr(ip("5.6.7.8")).await.unwrap().as_deref(),
            Some("mail.ex.com")
        );
    }

    #[tokio::test]
    async fn test_missing_ptr_is_none() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rdns/5.6.7.8"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": {"status": 404, "code": "RDNS_NOT_FOUND", "message": "rdns not found"}
            })))
            .mount(&mock_server)
            .await;

        let provider = create_mock_provider(&mock_server);
        assert_eq!(provider.get_ptr(ip("5.6.7.8")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_ptr_posts_form() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rdns/5.6.7.8"))
            .and(header("Authorization", BASIC_AUTH))
            .and(body_string_contains("ptr=mail.ex.com"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "rdns": {"ip": "5.6.7.8", "ptr": "mail.ex.com"}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = create_mock_provider(&mock_server);
        provider.set_ptr(ip("5.6.7.8"), "mail.ex.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"status": 401, "code": "UNAUTHORIZED", "message": "Unauthorized"}
            })))
            .mount(&mock_server)
            .await;

        let provider = create_mock_provider(&mock_server);
        assert!(matches!(
            provider.verify_credentials().await,
            Err(Error::Authentication(_))
        ));
    }
}
