// # Kubernetes Cluster Lookups
//
// `ClusterInfo` backed by the Kubernetes API:
//
// - DKIM public keys from `<service>-dkim-<domain-with-dashes>` secrets
// - LoadBalancer ingress addresses of the relay's service
// - External address of the node running this pod
//
// Lookups are read-only; the service account needs `get` on services,
// secrets and pods in its namespace and on nodes.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Secret, Service};
use kube::{Api, Client};
use maildns_core::traits::{ClusterInfo, ServiceType};
use maildns_core::{Error, Result};
use std::net::IpAddr;

/// Secret key holding the DKIM TXT payload
pub const DKIM_RECORD_KEY: &str = "dns.record";

/// Where the relay runs inside the cluster
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    /// Namespace of the relay
    pub namespace: String,
    /// Relay service name, also the DKIM secret prefix
    pub service_name: String,
    /// Name of this pod, for node address lookups
    pub pod_name: Option<String>,
}

/// Name of the secret holding a domain's DKIM key
///
/// ```rust
/// assert_eq!(
///     maildns_k8s::dkim_secret_name("relay", "mail.example.com"),
///     "relay-dkim-mail-example-com"
/// );
/// ```
pub fn dkim_secret_name(service_name: &str, domain: &str) -> String {
    format!("{}-dkim-{}", service_name, domain.replace('.', "-"))
}

/// Kubernetes-backed cluster lookups
pub struct KubeCluster {
    client: Client,
    settings: ClusterSettings,
}

impl KubeCluster {
    pub fn new(client: Client, settings: ClusterSettings) -> Self {
        Self { client, settings }
    }

    /// Connect with the in-cluster or kubeconfig credentials
    pub async fn try_default(settings: ClusterSettings) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::cluster(format!("Failed to create Kubernetes client: {}", e)))?;
        Ok(Self::new(client, settings))
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    async fn service(&self) -> Result<Option<Service>> {
        if self.settings.service_name.is_empty() {
            tracing::debug!("No service name configured");
            return Ok(None);
        }

        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.settings.namespace);
        api.get_opt(&self.settings.service_name).await.map_err(|e| {
            Error::cluster(format!(
                "Failed to get service {}/{}: {}",
                self.settings.namespace, self.settings.service_name, e
            ))
        })
    }
}

#[async_trait]
impl ClusterInfo for KubeCluster {
    async fn dkim_record(&self, domain: &str) -> Result<Option<String>> {
        let secret_name = dkim_secret_name(&self.settings.service_name, domain);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.settings.namespace);

        let secret = api.get_opt(&secret_name).await.map_err(|e| {
            Error::cluster(format!("Failed to get secret {}: {}", secret_name, e))
        })?;

        let Some(secret) = secret else {
            tracing::debug!("DKIM secret {} not found", secret_name);
            return Ok(None);
        };

        let value = secret
            .data
            .as_ref()
            .and_then(|data| data.get(DKIM_RECORD_KEY))
            .map(|bytes| String::from_utf8(bytes.0.clone()))
            .transpose()
            .map_err(|e| {
                Error::cluster(format!(
                    "Secret {}/{} is not valid UTF-8: {}",
                    secret_name, DKIM_RECORD_KEY, e
                ))
            })?;

        Ok(value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
    }

    async fn loadbalancer_ips(&self) -> Result<Vec<IpAddr>> {
        let Some(service) = self.service().await? else {
            return Ok(Vec::new());
        };

        let (mut ips, hostnames) = ingress_addresses(&service);
        for hostname in hostnames {
            match resolve_ipv4(&hostname).await {
                Some(ip) if !ips.contains(&ip) => ips.push(ip),
                Some(_) => {}
                None => tracing::debug!("Could not resolve LB hostname {}", hostname),
            }
        }
        Ok(ips)
    }

    async fn service_type(&self) -> Result<Option<ServiceType>> {
        Ok(self
            .service()
            .await?
            .and_then(|s| s.spec)
            .and_then(|spec| spec.type_)
            .map(|t| ServiceType::parse(&t)))
    }

    async fn node_external_ip(&self) -> Result<Option<IpAddr>> {
        let Some(pod_name) = self.settings.pod_name.as_deref().filter(|n| !n.is_empty()) else {
            return Ok(None);
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.settings.namespace);
        let pod = pods
            .get_opt(pod_name)
            .await
            .map_err(|e| Error::cluster(format!("Failed to get pod {}: {}", pod_name, e)))?;

        let Some(node_name) = pod.and_then(|p| p.spec).and_then(|s| s.node_name) else {
            return Ok(None);
        };

        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes
            .get_opt(&node_name)
            .await
            .map_err(|e| Error::cluster(format!("Failed to get node {}: {}", node_name, e)))?;

        Ok(node.as_ref().and_then(node_address))
    }
}

/// Ingress IPs (deduplicated, in order) and hostnames of a LoadBalancer
pub fn ingress_addresses(service: &Service) -> (Vec<IpAddr>, Vec<String>) {
    let mut ips = Vec::new();
    let mut hostnames = Vec::new();

    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref());

    for entry in ingress.into_iter().flatten() {
        if let Some(ip) = entry.ip.as_deref().and_then(|ip| ip.parse::<IpAddr>().ok())
            && !ips.contains(&ip)
        {
            ips.push(ip);
        }
        if let Some(hostname) = entry.hostname.as_deref().filter(|h| !h.is_empty()) {
            hostnames.push(hostname.to_string());
        }
    }

    (ips, hostnames)
}

/// External address of a node, falling back to its internal address
pub fn node_address(node: &Node) -> Option<IpAddr> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    let find = |kind: &str| {
        addresses
            .iter()
            .filter(|a| a.type_ == kind)
            .find_map(|a| a.address.parse::<IpAddr>().ok())
    };

    find("ExternalIP").or_else(|| {
        let internal = find("InternalIP");
        if let Some(ip) = internal {
            tracing::warn!("Using node InternalIP: {}", ip);
        }
        internal
    })
}

async fn resolve_ipv4(hostname: &str) -> Option<IpAddr> {
    tokio::net::lookup_host((hostname, 0))
        .await
        .ok()?
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
}

/// `ClusterInfo` for running outside Kubernetes: every lookup is empty
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCluster;

#[async_trait]
impl ClusterInfo for NoCluster {
    async fn dkim_record(&self, _domain: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn loadbalancer_ips(&self) -> Result<Vec<IpAddr>> {
        Ok(Vec::new())
    }

    async fn service_type(&self) -> Result<Option<ServiceType>> {
        Ok(None)
    }

    async fn node_external_ip(&self) -> Result<Option<IpAddr>> {
        Ok(None)
    }
}
