// # Hetzner PTR Providers
//
// Reverse DNS for the relay's outbound address on Hetzner infrastructure.
//
// - [`HetznerCloudPtr`]: Hetzner Cloud API (servers, primary IPs, floating IPs)
// - [`HetznerRobotPtr`]: Robot webservice for dedicated servers
//
// Both implement `maildns_core::traits::PtrProvider`. Dry-run and the
// "already correct" short-circuit are handled by the reconciler.

mod cloud;
mod robot;

pub use cloud::{HETZNER_CLOUD_API_BASE, HetznerCloudPtr, IpKind};
pub use robot::{HETZNER_ROBOT_API_BASE, HetznerRobotPtr};

use maildns_core::config::PtrSettings;
use maildns_core::registry::ProviderRegistry;
use maildns_core::traits::PtrProvider;
use maildns_core::{Error, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Error body shared by both Hetzner APIs
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(DEFAULT_HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))
}

/// Map a non-success HTTP status to an error
///
/// The API's own `error.message` is preferred over the raw body.
fn status_error(api: &str, status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.to_string());

    match status.as_u16() {
        401 | 403 => Error::auth(format!("{} rejected the credentials: {}", api, message)),
        404 => Error::not_found(format!("{}: {}", api, message)),
        429 => Error::rate_limited(format!("{} rate limit exceeded", api)),
        500..=599 => Error::http(format!("{} server error (transient): {} - {}", api, status, message)),
        _ => Error::ptr_provider(format!("{} error: {} - {}", api, status, message)),
    }
}

/// Factory for the Hetzner Cloud PTR provider
pub fn create_cloud_provider(settings: &PtrSettings) -> Result<Arc<dyn PtrProvider>> {
    match settings {
        PtrSettings::HetznerCloud { api_token, api_base } => {
            let provider = HetznerCloudPtr::new(api_token.clone())?;
            Ok(Arc::new(match api_base {
                Some(base) => provider.with_base_url(base.clone()),
                None => provider,
            }))
        }
        PtrSettings::HetznerRobot { .. } => Err(Error::config(
            "Hetzner Cloud PTR provider requires an API token",
        )),
    }
}

/// Factory for the Hetzner Robot PTR provider
pub fn create_robot_provider(settings: &PtrSettings) -> Result<Arc<dyn PtrProvider>> {
    match settings {
        PtrSettings::HetznerRobot {
            username,
            password,
            api_base,
        } => {
            let provider = HetznerRobotPtr::new(username.clone(), password.clone())?;
            Ok(Arc::new(match api_base {
                Some(base) => provider.with_base_url(base.clone()),
                None => provider,
            }))
        }
        PtrSettings::HetznerCloud { .. } => Err(Error::config(
            "Hetzner Robot PTR provider requires webservice credentials",
        )),
    }
}

/// Register the Hetzner PTR providers with a registry
///
/// `hetzner` is an alias for `hetzner-cloud`.
pub fn register(registry: &mut ProviderRegistry) {
    registry.register_ptr_provider("hetzner", Box::new(create_cloud_provider));
    registry.register_ptr_provider("hetzner-cloud", Box::new(create_cloud_provider));
    registry.register_ptr_provider("hetzner-robot", Box::new(create_robot_provider));
}
