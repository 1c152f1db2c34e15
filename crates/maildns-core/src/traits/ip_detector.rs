// # IP Detector Trait
//
// Supplies the relay's network identity: the address clients connect to
// (incoming) and the address the relay's mail leaves from (outbound).
//
// ## Implementations
//
// - `maildns-ip-http`: static IPs, cluster-assigned IPs, public echo services

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for IP detection
///
/// Detection is best effort: failures are logged by the implementation and
/// surface as `None` or an empty set.
#[async_trait]
pub trait IpDetector: Send + Sync {
    /// Address published in the A record
    ///
    /// May block up to `wait` for a LoadBalancer address to be assigned;
    /// returns early with `None` when `cancel` fires.
    async fn incoming_ip(&self, wait: Duration, cancel: &CancellationToken) -> Option<IpAddr>;

    /// Address outbound mail is seen from
    async fn outbound_ip(&self) -> Option<IpAddr>;

    /// Every address that may send mail for the relay
    async fn all_ips(&self, wait: Duration, cancel: &CancellationToken) -> BTreeSet<IpAddr>;
}
