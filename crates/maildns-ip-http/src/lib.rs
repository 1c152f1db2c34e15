// # IP Detection
//
// Works out the relay's network identity for the reconciler.
//
// ## Incoming IP (published in the A record)
//
// 1. Static IPs, when configured, win outright
// 2. Otherwise the relay's service type decides:
//    - LoadBalancer: first ingress address, polled until assigned
//    - NodePort: external address of the node running this pod
// 3. Fallback: the outbound IP
//
// ## Outbound IP
//
// First valid IPv4 answer from a list of public echo services
// (e.g. ifconfig.me, icanhazip.com), tried in order.

use async_trait::async_trait;
use maildns_core::traits::{ClusterInfo, IpDetector, ServiceType};
use maildns_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default outbound IP echo services, tried in order
pub const DEFAULT_IP_SERVICES: &[&str] = &[
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
    "https://api.ipify.org",
    "https://ipinfo.io/ip",
];

const USER_AGENT: &str = "mail-relay-dns-manager";

/// IP detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpDetectorConfig {
    /// Fixed addresses; the first is the incoming IP
    #[serde(default)]
    pub static_ips: Vec<IpAddr>,

    /// Echo services queried for the outbound IP
    #[serde(default = "default_external_apis")]
    pub external_apis: Vec<String>,

    /// Query the echo services at all
    #[serde(default = "default_detect_outbound")]
    pub detect_outbound: bool,

    /// Per-request timeout for the echo services
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Wait between LoadBalancer ingress checks
    #[serde(skip, default = "default_lb_poll_interval")]
    pub lb_poll_interval: Duration,
}

fn default_external_apis() -> Vec<String> {
    DEFAULT_IP_SERVICES.iter().map(|s| s.to_string()).collect()
}

fn default_detect_outbound() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_lb_poll_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for IpDetectorConfig {
    fn default() -> Self {
        Self {
            static_ips: Vec::new(),
            external_apis: default_external_apis(),
            detect_outbound: default_detect_outbound(),
            timeout_secs: default_timeout_secs(),
            lb_poll_interval: default_lb_poll_interval(),
        }
    }
}

/// IP detector backed by static config, the cluster and echo services
pub struct HttpIpDetector {
    config: IpDetectorConfig,
    cluster: Option<Arc<dyn ClusterInfo>>,
    client: reqwest::Client,
}

impl HttpIpDetector {
    /// Create a detector without cluster access
    pub fn new(config: IpDetectorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            cluster: None,
            client,
        })
    }

    /// Use the cluster to find LoadBalancer and node addresses
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterInfo>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn config(&self) -> &IpDetectorConfig {
        &self.config
    }

    /// First valid IPv4 address reported by an echo service
    async fn detect_outbound(&self) -> Option<IpAddr> {
        for url in &self.config.external_apis {
            match self.fetch_ipv4(url).await {
                Ok(ip) => {
                    tracing::debug!("Detected outbound IP via {}: {}", url, ip);
                    return Some(IpAddr::V4(ip));
                }
                Err(e) => tracing::debug!("Failed to get IP from {}: {}", url, e),
            }
        }

        tracing::warn!("Could not detect outbound IP from any API");
        None
    }

    async fn fetch_ipv4(&self, url: &str) -> Result<Ipv4Addr> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::ip_detection(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::ip_detection(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::ip_detection(format!("Failed to read response: {}", e)))?;

        text.trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| Error::ip_detection(format!("Not an IPv4 address: {}", text.trim())))
    }

    /// Address assigned to the relay's service, if the cluster knows one
    ///
    /// `Err` only when cancelled.
    async fn service_ip(
        &self,
        cluster: &dyn ClusterInfo,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<IpAddr>, Cancelled> {
        let service_type = match cluster.service_type().await {
            Ok(service_type) => service_type,
            Err(e) => {
                tracing::warn!("Could not read service type: {}", e);
                None
            }
        };

        match service_type {
            Some(ServiceType::LoadBalancer) => self.wait_for_loadbalancer(cluster, wait, cancel).await,
            Some(ServiceType::NodePort) => Ok(match cluster.node_external_ip().await {
                Ok(ip) => ip,
                Err(e) => {
                    tracing::warn!("Could not read node address: {}", e);
                    None
                }
            }),
            _ => Ok(None),
        }
    }

    async fn wait_for_loadbalancer(
        &self,
        cluster: &dyn ClusterInfo,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<IpAddr>, Cancelled> {
        let started = tokio::time::Instant::now();

        loop {
            match cluster.loadbalancer_ips().await {
                Ok(ips) => {
                    if let Some(ip) = ips.first() {
                        return Ok(Some(*ip));
                    }
                }
                Err(e) => tracing::warn!("Could not read LoadBalancer status: {}", e),
            }

            if wait.is_zero() {
                return Ok(None);
            }

            let elapsed = started.elapsed();
            if elapsed >= wait {
                tracing::error!("Timeout waiting for LoadBalancer IP after {:?}", wait);
                return Ok(None);
            }

            tracing::info!(
                "Waiting for LoadBalancer IP... ({}s/{}s)",
                elapsed.as_secs(),
                wait.as_secs()
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("LoadBalancer wait cancelled");
                    return Err(Cancelled);
                }
                _ = tokio::time::sleep(self.config.lb_poll_interval) => {}
            }
        }
    }
}

/// Marker for a wait that ended through cancellation
#[derive(Debug)]
struct Cancelled;

#[async_trait]
impl IpDetector for HttpIpDetector {
    async fn incoming_ip(&self, wait: Duration, cancel: &CancellationToken) -> Option<IpAddr> {
        if let Some(ip) = self.config.static_ips.first() {
            return Some(*ip);
        }

        if let Some(cluster) = &self.cluster {
            match self.service_ip(cluster.as_ref(), wait, cancel).await {
                Ok(Some(ip)) => return Some(ip),
                Ok(None) => {}
                Err(Cancelled) => return None,
            }
        }

        self.outbound_ip().await
    }

    async fn outbound_ip(&self) -> Option<IpAddr> {
        if !self.config.detect_outbound {
            return None;
        }
        self.detect_outbound().await
    }

    async fn all_ips(&self, wait: Duration, cancel: &CancellationToken) -> BTreeSet<IpAddr> {
        if !self.config.static_ips.is_empty() {
            return self.config.static_ips.iter().copied().collect();
        }

        let mut ips = BTreeSet::new();
        ips.extend(self.incoming_ip(wait, cancel).await);
        ips.extend(self.outbound_ip().await);
        ips
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    /// Cluster whose LoadBalancer address appears after a number of checks
    struct FakeCluster {
        service_type: Option<ServiceType>,
        lb_ips: Vec<IpAddr>,
        lb_ready_after: usize,
        lb_checks: AtomicUsize,
        node_ip: Mutex<Option<IpAddr>>,
    }

    impl FakeCluster {
        fn new(service_type: ServiceType) -> Self {
            Self {
                service_type: Some(service_type),
                lb_ips: Vec::new(),
                lb_ready_after: 0,
                lb_checks: AtomicUsize::new(0),
                node_ip: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl ClusterInfo for FakeCluster {
        async fn dkim_record(&self, _domain: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn loadbalancer_ips(&self) -> Result<Vec<IpAddr>> {
            let checks = self.lb_checks.fetch_add(1, Ordering::SeqCst);
            if checks >= self.lb_ready_after {
                Ok(self.lb_ips.clone())
            } else {
                Ok(Vec::new())
            }
        }

        async fn service_type(&self) -> Result<Option<ServiceType>> {
            Ok(self.service_type.clone())
        }

        async fn node_external_ip(&self) -> Result<Option<IpAddr>> {
            Ok(*self.node_ip.lock().unwrap())
        }
    }

    fn config_for(mock_server: &MockServer, paths: &[&str]) -> IpDetectorConfig {
        IpDetectorConfig {
            external_apis: paths
                .iter()
                .map(|p| format!("{}{}", mock_server.uri(), p))
                .collect(),
            lb_poll_interval: Duration::from_millis(10),
            ..IpDetectorConfig::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = IpDetectorConfig::default();
        assert_eq!(config.external_apis.len(), 4);
        assert_eq!(config.external_apis[0], "https://ifconfig.me/ip");
        assert!(config.detect_outbound);
        assert_eq!(config.timeout_secs, 15);
    }

    #[tokio::test]
    async fn test_static_ips_win() {
        let mock_server = MockServer::start().await;
        let config = IpDetectorConfig {
            static_ips: vec![ip("1.2.3.4"), ip("5.6.7.8")],
            ..config_for(&mock_server, &["/ip"])
        };
        let detector = HttpIpDetector::new(config).unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(detector.incoming_ip(Duration::ZERO, &cancel).await, Some(ip("1.2.3.4")));
        assert_eq!(
            detector.all_ips(Duration::ZERO, &cancel).await,
            BTreeSet::from([ip("1.2.3.4"), ip("5.6.7.8")])
        );
        assert!(mock_server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outbound_tries_services_in_order() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v6"))
            .respond_with(ResponseTemplate::new(200).set_body_string("2001:db8::1\n"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ip"))
            .and(header("User-Agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_string("  5.6.7.8\n"))
            .mount(&mock_server)
            .await;

        let detector =
            HttpIpDetector::new(config_for(&mock_server, &["/down", "/v6", "/ip"])).unwrap();
        assert_eq!(detector.outbound_ip().await, Some(ip("5.6.7.8")));
    }

    #[tokio::test]
    async fn test_outbound_disabled() {
        let mock_server = MockServer::start().await;
        let config = IpDetectorConfig {
            detect_outbound: false,
            ..config_for(&mock_server, &["/ip"])
        };
        let detector = HttpIpDetector::new(config).unwrap();
        assert_eq!(detector.outbound_ip().await, None);
        assert_eq!(
            detector
                .incoming_ip(Duration::ZERO, &CancellationToken::new())
                .await,
            None
        );
    }

    #[tokio::test]
    async fn test_loadbalancer_address_is_awaited() {
        let mock_server = MockServer::start().await;
        let mut cluster = FakeCluster::new(ServiceType::LoadBalancer);
        cluster.lb_ips = vec![ip("1.2.3.4")];
        cluster.lb_ready_after = 3;
        let cluster = Arc::new(cluster);

        let detector = HttpIpDetector::new(config_for(&mock_server, &["/ip"]))
            .unwrap()
            .with_cluster(cluster.clone());

        let incoming = detector
            .incoming_ip(Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(incoming, Some(ip("1.2.3.4")));
        assert_eq!(cluster.lb_checks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_loadbalancer_wait_is_cancellable() {
        let mock_server = MockServer::start().await;
        let cluster = Arc::new(FakeCluster::new(ServiceType::LoadBalancer));
        let detector = HttpIpDetector::new(config_for(&mock_server, &["/ip"]))
            .unwrap()
            .with_cluster(cluster);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            detector.incoming_ip(Duration::from_secs(3600), &cancel),
        )
        .await;
        assert_eq!(result.unwrap(), None);
        // Cancellation does not fall back to the echo services.
        assert!(mock_server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unassigned_loadbalancer_falls_back_to_outbound() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ip"))
            .respond_with(ResponseTemplate::new(200).set_body_string("5.6.7.8"))
            .mount(&mock_server)
            .await;

        let cluster = Arc::new(FakeCluster::new(ServiceType::LoadBalancer));
        let detector = HttpIpDetector::new(config_for(&mock_server, &["/ip"]))
            .unwrap()
            .with_cluster(cluster);

        assert_eq!(
            detector
                .incoming_ip(Duration::ZERO, &CancellationToken::new())
                .await,
            Some(ip("5.6.7.8"))
        );
    }

    #[tokio::test]
    async fn test_nodeport_uses_node_address() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ip"))
            .respond_with(ResponseTemplate::new(200).set_body_string("5.6.7.8"))
            .mount(&mock_server)
            .await;

        let cluster = FakeCluster::new(ServiceType::NodePort);
        *cluster.node_ip.lock().unwrap() = Some(ip("9.9.9.9"));
        let detector = HttpIpDetector::new(config_for(&mock_server, &["/ip"]))
            .unwrap()
            .with_cluster(Arc::new(cluster));
        let cancel = CancellationToken::new();

        assert_eq!(detector.incoming_ip(Duration::ZERO, &cancel).await, Some(ip("9.9.9.9")));
        assert_eq!(
            detector.all_ips(Duration::ZERO, &cancel).await,
            BTreeSet::from([ip("9.9.9.9"), ip("5.6.7.8")])
        );
    }
}
