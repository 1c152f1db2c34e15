//! Configuration types for the mail relay DNS reconciler
//!
//! Values are read once at process start; nothing here is re-read during a
//! reconciliation run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// Ownership and write-policy settings shared by every provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable identifier written into ownership markers
    pub owner_id: String,

    /// Label prefix for marker records (`_<prefix>.<name>`)
    #[serde(default = "default_txt_prefix")]
    pub txt_prefix: String,

    /// TTL applied to created records
    #[serde(default = "default_ttl")]
    pub default_ttl: u32,

    /// Log intended mutations instead of performing them
    #[serde(default)]
    pub dry_run: bool,
}

impl ProviderConfig {
    /// Create a configuration for an owner with defaults for everything else
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            txt_prefix: default_txt_prefix(),
            default_ttl: default_ttl(),
            dry_run: false,
        }
    }

    /// Enable or disable dry-run mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(Error::config("owner_id cannot be empty"));
        }
        if self.owner_id.contains(',') || self.owner_id.contains('=') {
            return Err(Error::config(format!(
                "owner_id '{}' must not contain ',' or '='",
                self.owner_id
            )));
        }
        if self.txt_prefix.is_empty() {
            return Err(Error::config("txt_prefix cannot be empty"));
        }
        if self.default_ttl == 0 {
            return Err(Error::config("default_ttl must be at least 1 second"));
        }
        Ok(())
    }
}

/// A mail domain served by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Domain name (e.g. "example.com")
    pub name: String,

    /// DKIM selector used for `<selector>._domainkey.<domain>`
    #[serde(
        rename = "dkimSelector",
        alias = "dkim_selector",
        default = "default_dkim_selector"
    )]
    pub dkim_selector: String,
}

impl DomainConfig {
    /// Create a domain entry with the default selector
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dkim_selector: default_dkim_selector(),
        }
    }

    /// Set the DKIM selector
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.dkim_selector = selector.into();
        self
    }

    /// Parse a domain list
    ///
    /// Accepts a JSON array of `{name, dkimSelector}` objects; anything that
    /// is not valid JSON is read as a comma-separated list of names using
    /// the default selector.
    pub fn parse_list(raw: &str) -> Vec<DomainConfig> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Vec::new();
        }

        match serde_json::from_str::<Vec<DomainConfig>>(raw) {
            Ok(domains) => domains
                .into_iter()
                .filter(|d| !d.name.trim().is_empty())
                .collect(),
            Err(_) => raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(DomainConfig::new)
                .collect(),
        }
    }
}

/// Mail identity to publish
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// Relay hostname (target of the A record and of every MX)
    pub hostname: String,

    /// Domains the relay sends and receives for
    pub domains: Vec<DomainConfig>,

    /// Publish the A record for the hostname
    #[serde(default = "default_enabled")]
    pub create_a: bool,

    /// Publish MX records
    #[serde(default = "default_enabled")]
    pub create_mx: bool,

    /// Publish SPF records
    #[serde(default = "default_enabled")]
    pub create_spf: bool,

    /// Publish DKIM records
    #[serde(default = "default_enabled")]
    pub create_dkim: bool,

    /// Publish DMARC records
    #[serde(default = "default_enabled")]
    pub create_dmarc: bool,

    /// SPF qualifier appended after the ip mechanisms
    #[serde(default = "default_spf_policy")]
    pub spf_policy: String,

    /// DMARC `p=` policy
    #[serde(default = "default_dmarc_policy")]
    pub dmarc_policy: String,

    /// DMARC `pct=` percentage
    #[serde(default)]
    pub dmarc_pct: Option<u8>,

    /// DMARC aggregate report address (defaults to postmaster@<domain>)
    #[serde(default)]
    pub dmarc_rua: Option<String>,

    /// TTL for published records
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

impl MailConfig {
    /// Create a configuration with every record type enabled
    pub fn new(hostname: impl Into<String>, domains: Vec<DomainConfig>) -> Self {
        Self {
            hostname: hostname.into(),
            domains,
            create_a: true,
            create_mx: true,
            create_spf: true,
            create_dkim: true,
            create_dmarc: true,
            spf_policy: default_spf_policy(),
            dmarc_policy: default_dmarc_policy(),
            dmarc_pct: None,
            dmarc_rua: None,
            ttl: default_ttl(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(Error::config("mail hostname is required"));
        }
        if !self.hostname.contains('.') {
            return Err(Error::config(format!(
                "mail hostname '{}' must be fully qualified",
                self.hostname
            )));
        }
        if self.domains.is_empty() {
            return Err(Error::config("at least one mail domain is required"));
        }
        if let Some(pct) = self.dmarc_pct
            && pct > 100
        {
            return Err(Error::config(format!(
                "DMARC pct must be between 0 and 100, got {pct}"
            )));
        }
        if self.ttl == 0 {
            return Err(Error::config("record TTL must be at least 1 second"));
        }
        Ok(())
    }
}

/// Reverse DNS settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PtrConfig {
    /// Manage the PTR record at all
    #[serde(default)]
    pub enabled: bool,

    /// Registered PTR provider name (e.g. "hetzner", "hetzner-robot")
    #[serde(default)]
    pub provider: Option<String>,

    /// PTR target; falls back to the mail hostname
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Backend settings used to construct a DNS provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderSettings {
    /// Cloudflare API v4
    Cloudflare {
        /// API token with Zone:Read and DNS:Edit permissions
        api_token: String,
        /// Pre-configured domain → zone id pairs
        #[serde(default)]
        zone_ids: HashMap<String, String>,
        /// Proxy eligible records through Cloudflare
        #[serde(default)]
        proxied: bool,
        /// API base URL override
        #[serde(default)]
        api_base: Option<String>,
    },
}

impl ProviderSettings {
    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        match self {
            ProviderSettings::Cloudflare { api_token, .. } => {
                if api_token.trim().is_empty() {
                    return Err(Error::config("Cloudflare API token cannot be empty"));
                }
                Ok(())
            }
        }
    }

    /// Registry name of the provider these settings target
    pub fn type_name(&self) -> &str {
        match self {
            ProviderSettings::Cloudflare { .. } => "cloudflare",
        }
    }
}

/// Backend settings used to construct a PTR provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PtrSettings {
    /// Hetzner Cloud API
    HetznerCloud {
        /// Project API token
        api_token: String,
        /// API base URL override
        #[serde(default)]
        api_base: Option<String>,
    },

    /// Hetzner Robot webservice (dedicated servers)
    HetznerRobot {
        /// Webservice user
        username: String,
        /// Webservice password
        password: String,
        /// API base URL override
        #[serde(default)]
        api_base: Option<String>,
    },
}

impl PtrSettings {
    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        match self {
            PtrSettings::HetznerCloud { api_token, .. } => {
                if api_token.trim().is_empty() {
                    return Err(Error::config("Hetzner Cloud API token cannot be empty"));
                }
            }
            PtrSettings::HetznerRobot {
                username, password, ..
            } => {
                if username.is_empty() || password.is_empty() {
                    return Err(Error::config(
                        "Hetzner Robot username and password are required",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Timing of the drift watch loop
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Wait between polls
    pub interval: Duration,

    /// Wait between checks for the initializer's state document
    pub initial_state_poll: Duration,

    /// Pause after requesting a restart of the co-located process
    pub restart_grace: Duration,

    /// Emit an info-level heartbeat every this many quiet ticks
    pub heartbeat_every: u64,

    /// Capacity of the watch event channel
    pub event_channel_capacity: usize,
}

impl WatchConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::config("watch interval must be greater than zero"));
        }
        if self.heartbeat_every == 0 {
            return Err(Error::config("heartbeat_every must be at least 1"));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::config("event_channel_capacity must be at least 1"));
        }
        Ok(())
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_state_poll: Duration::from_secs(1),
            restart_grace: Duration::from_secs(60),
            heartbeat_every: 10,
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_txt_prefix() -> String {
    "mail-relay-owner".to_string()
}

fn default_ttl() -> u32 {
    crate::record::DEFAULT_TTL
}

fn default_dkim_selector() -> String {
    "mail".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_spf_policy() -> String {
    "~all".to_string()
}

fn default_dmarc_policy() -> String {
    "none".to_string()
}

fn default_event_channel_capacity() -> usize {
    64
}
