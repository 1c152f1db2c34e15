// Public DNS propagation checks for the `verify` command

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Wait between propagation checks
pub const VERIFY_INTERVAL: Duration = Duration::from_secs(10);

/// Read-only DNS lookups
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn addresses(&self, name: &str) -> Vec<IpAddr>;
    async fn txt(&self, name: &str) -> Vec<String>;
}

/// Lookups through the system resolver configuration, without caching
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl Default for HickoryLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl HickoryLookup {
    pub fn new() -> Self {
        let (config, mut options) = hickory_resolver::system_conf::read_system_conf()
            .unwrap_or_else(|e| {
                debug!("Falling back to public resolvers: {}", e);
                (ResolverConfig::cloudflare(), ResolverOpts::default())
            });
        // No caching between checks.
        options.cache_size = 0;
        options.use_hosts_file = false;

        Self {
            resolver: TokioAsyncResolver::tokio(config, options),
        }
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn addresses(&self, name: &str) -> Vec<IpAddr> {
        match self.resolver.lookup_ip(name).await {
            Ok(lookup) => lookup.iter().collect(),
            Err(e) => {
                debug!("Address lookup for {} failed: {}", name, e);
                Vec::new()
            }
        }
    }

    async fn txt(&self, name: &str) -> Vec<String> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => lookup
                .iter()
                .map(|record| {
                    record
                        .txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data).to_string())
                        .collect::<String>()
                })
                .collect(),
            Err(e) => {
                debug!("TXT lookup for {} failed: {}", name, e);
                Vec::new()
            }
        }
    }
}

/// What must be publicly visible before `verify` succeeds
#[derive(Debug, Clone, Default)]
pub struct PropagationTarget {
    /// Hostname whose address is checked, if the A record is managed
    pub hostname: Option<String>,
    /// Address the hostname must resolve to; any address when unknown
    pub expected_ip: Option<IpAddr>,
    /// `(domain, record name)` of each published DKIM key
    pub dkim: Vec<(String, String)>,
}

/// One round of checks: whether everything is visible, plus a status line
pub async fn check_once(target: &PropagationTarget, lookup: &dyn DnsLookup) -> (bool, Vec<String>) {
    let mut all_visible = true;
    let mut status = Vec::new();

    if let Some(hostname) = &target.hostname {
        let addresses = lookup.addresses(hostname).await;
        let visible = match target.expected_ip {
            Some(ip) => addresses.contains(&ip),
            None => !addresses.is_empty(),
        };
        status.push(format!("A:{}:{}", hostname, mark(visible)));
        all_visible &= visible;
    }

    for (domain, name) in &target.dkim {
        let visible = !lookup.txt(name).await.is_empty();
        status.push(format!("DKIM:{}:{}", domain, mark(visible)));
        all_visible &= visible;
    }

    (all_visible, status)
}

fn mark(ok: bool) -> &'static str {
    if ok { "ok" } else { "missing" }
}

/// Poll until every target is visible or `timeout` elapses
pub async fn verify(
    target: &PropagationTarget,
    lookup: &dyn DnsLookup,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> bool {
    info!("Verifying DNS propagation (timeout: {}s)...", timeout.as_secs());
    let started = tokio::time::Instant::now();

    loop {
        let (all_visible, status) = check_once(target, lookup).await;
        let elapsed = started.elapsed();

        if all_visible {
            info!("All DNS records verified: {}", status.join(" "));
            return true;
        }
        if elapsed >= timeout {
            error!("DNS verification timeout after {}s", timeout.as_secs());
            error!("Status: {}", status.join(" "));
            return false;
        }

        info!(
            "[{}s/{}s] {}",
            elapsed.as_secs(),
            timeout.as_secs(),
            status.join(" ")
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Verification cancelled");
                return false;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
