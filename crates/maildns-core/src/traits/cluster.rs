// # Cluster Trait
//
// The reconciler's view of the cluster it runs in: where the DKIM public
// keys live and how the relay's service is exposed.
//
// ## Implementations
//
// - Kubernetes API: `maildns-k8s` crate

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;

/// How the relay's service is exposed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceType {
    /// Cloud load balancer with its own ingress address
    LoadBalancer,
    /// Node port on every node's address
    NodePort,
    /// Cluster-internal only
    ClusterIp,
    /// Anything else reported by the cluster
    Other(String),
}

impl ServiceType {
    /// Parse the cluster's service type string
    pub fn parse(raw: &str) -> Self {
        match raw {
            "LoadBalancer" => ServiceType::LoadBalancer,
            "NodePort" => ServiceType::NodePort,
            "ClusterIP" => ServiceType::ClusterIp,
            other => ServiceType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceType::LoadBalancer => f.write_str("LoadBalancer"),
            ServiceType::NodePort => f.write_str("NodePort"),
            ServiceType::ClusterIp => f.write_str("ClusterIP"),
            ServiceType::Other(other) => f.write_str(other),
        }
    }
}

/// Trait for cluster lookups
#[async_trait]
pub trait ClusterInfo: Send + Sync {
    /// DKIM TXT payload for a domain, if its key secret exists
    async fn dkim_record(&self, domain: &str) -> Result<Option<String>, crate::Error>;

    /// Addresses currently assigned to the relay's LoadBalancer
    async fn loadbalancer_ips(&self) -> Result<Vec<IpAddr>, crate::Error>;

    /// Exposure type of the relay's service
    async fn service_type(&self) -> Result<Option<ServiceType>, crate::Error>;

    /// External address of the node running this process
    async fn node_external_ip(&self) -> Result<Option<IpAddr>, crate::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_round_trip() {
        for raw in ["LoadBalancer", "NodePort", "ClusterIP", "ExternalName"] {
            assert_eq!(ServiceType::parse(raw).to_string(), raw);
        }
        assert_eq!(
            ServiceType::parse("ExternalName"),
            ServiceType::Other("ExternalName".to_string())
        );
    }
}
