//! Reconciler
//!
//! [`DnsManager`] drives the desired record set through the ownership layer:
//!
//! ```text
//! IpDetector ──┐
//!              ├─► DesiredState::build ─► OwnershipRegistry ─► DnsProvider
//! ClusterInfo ─┘                                  │
//!                                                 └─► PtrProvider
//! ```
//!
//! Records are applied one after another. A failing record marks the run
//! as failed but never stops the remaining records from being attempted.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MailConfig, ProviderConfig, PtrConfig};
use crate::desired::{DesiredRecord, DesiredState, PtrTarget, RecordKind};
use crate::ownership::{OwnershipRegistry, select_existing};
use crate::record::RecordType;
use crate::traits::{ClusterInfo, DetectedState, DnsProvider, IpDetector, PtrProvider};

/// Maximum characters of record content shown in status reports
const STATUS_CONTENT_LIMIT: usize = 50;

/// Owned records per domain, as printed by `status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Owner identifier of this instance
    pub owner_id: String,
    /// Per-domain zone and owned records
    pub domains: BTreeMap<String, DomainStatus>,
}

/// Owned records in one domain's zone
#[derive(Debug, Clone, Serialize)]
pub struct DomainStatus {
    /// Hosting zone, if it could be resolved
    pub zone_id: Option<String>,
    /// Owned records
    pub records: Vec<RecordSummary>,
}

/// Short description of an owned record
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    /// Record name
    pub name: String,
    /// Record type
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Content, truncated for display
    pub content: String,
}

/// Mail relay DNS reconciler
pub struct DnsManager {
    registry: OwnershipRegistry<dyn DnsProvider>,
    mail: MailConfig,
    ptr_config: PtrConfig,
    ptr_provider: Option<Arc<dyn PtrProvider>>,
    cluster: Arc<dyn ClusterInfo>,
    detector: Arc<dyn IpDetector>,
    zones: Mutex<HashMap<String, String>>,
    cancel: CancellationToken,
}

impl DnsManager {
    /// Create a reconciler
    ///
    /// # Parameters
    ///
    /// - `provider`: DNS backend holding the forward records
    /// - `provider_config`: Owner identity and dry-run switch
    /// - `mail`: Mail identity to publish
    /// - `cluster`: DKIM and service lookups
    /// - `detector`: Network identity detection
    pub fn new(
        provider: Arc<dyn DnsProvider>,
        provider_config: ProviderConfig,
        mail: MailConfig,
        cluster: Arc<dyn ClusterInfo>,
        detector: Arc<dyn IpDetector>,
    ) -> Self {
        Self {
            registry: OwnershipRegistry::new(provider, provider_config),
            mail,
            ptr_config: PtrConfig::default(),
            ptr_provider: None,
            cluster,
            detector,
            zones: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Manage the PTR record with `provider`
    ///
    /// With `config.enabled` set but no provider, the PTR step is skipped
    /// with a warning.
    pub fn with_ptr(mut self, config: PtrConfig, provider: Option<Arc<dyn PtrProvider>>) -> Self {
        self.ptr_config = config;
        self.ptr_provider = provider;
        self
    }

    /// Observe `cancel` at every wait and between records
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The ownership layer
    pub fn registry(&self) -> &OwnershipRegistry<dyn DnsProvider> {
        &self.registry
    }

    /// The mail configuration
    pub fn mail_config(&self) -> &MailConfig {
        &self.mail
    }

    /// The IP detector shared with the watch loop
    pub fn detector(&self) -> &Arc<dyn IpDetector> {
        &self.detector
    }

    /// Detect the relay's network identity
    ///
    /// Waits up to `wait_for_lb` for a LoadBalancer address. Returns `None`
    /// when no incoming address can be found.
    pub async fn detect(&self, wait_for_lb: Duration) -> Option<DetectedState> {
        let Some(incoming_ip) = self.detector.incoming_ip(wait_for_lb, &self.cancel).await else {
            error!("Could not determine incoming IP");
            return None;
        };
        let outbound_ip = self.detector.outbound_ip().await;
        // The LoadBalancer address is known by now; no further waiting.
        let all_ips = self.detector.all_ips(Duration::ZERO, &self.cancel).await;

        let detected = DetectedState::new(incoming_ip, outbound_ip, all_ips);
        // Called on every watch tick.
        debug!("Detected {}", detected);
        Some(detected)
    }

    /// Detect and apply
    ///
    /// # Returns
    ///
    /// `true` when every applicable record converged.
    pub async fn init_or_update(&self, wait_for_lb: Duration) -> bool {
        match self.detect(wait_for_lb).await {
            Some(detected) => {
                info!("Detected {}", detected);
                self.apply(&detected).await
            }
            None => false,
        }
    }

    /// Apply the desired state for `detected`
    pub async fn apply(&self, detected: &DetectedState) -> bool {
        let dkim = self.fetch_dkim().await;
        let desired = DesiredState::build(&self.mail, &self.ptr_config, detected, &dkim);
        let mut success = true;

        if self.registry.is_dry_run() {
            info!("Dry-run mode: no DNS changes will be made");
        }

        for group in &desired.groups {
            let Some(zone_id) = self.zone_id(&group.zone_hint).await else {
                error!("No zone found for {}, skipping its records", group.zone_hint);
                success = false;
                continue;
            };

            for desired_record in &group.records {
                if self.cancel.is_cancelled() {
                    warn!("Shutdown requested, stopping reconciliation before remaining records");
                    return false;
                }
                if !self.ensure(&zone_id, desired_record).await {
                    success = false;
                }
            }
        }

        if self.ptr_config.enabled {
            if self.cancel.is_cancelled() {
                return false;
            }
            if let Some(target) = &desired.ptr
                && !self.ensure_ptr(target).await
            {
                success = false;
            }
        }

        if success {
            info!("DNS records reconciled");
        } else {
            warn!("DNS reconciliation finished with failures");
        }
        success
    }

    /// Compare published records against the desired state without writing
    ///
    /// # Returns
    ///
    /// `(true, [])` when everything matches, otherwise `false` and one
    /// human-readable issue per missing or mismatching record.
    pub async fn check_records(
        &self,
        incoming_ip: IpAddr,
        all_ips: &BTreeSet<IpAddr>,
    ) -> (bool, Vec<String>) {
        let detected = DetectedState::new(incoming_ip, None, all_ips.iter().copied());
        let dkim = self.fetch_dkim().await;
        let desired = DesiredState::build(&self.mail, &PtrConfig::default(), &detected, &dkim);
        let mut issues = Vec::new();

        for group in &desired.groups {
            let Some(zone_id) = self.zone_id(&group.zone_hint).await else {
                issues.push(format!("Zone not found for {}", group.zone_hint));
                continue;
            };

            for desired_record in &group.records {
                if let Some(issue) = self.check(&zone_id, desired_record).await {
                    issues.push(issue);
                }
            }
        }

        (issues.is_empty(), issues)
    }

    /// Delete every record owned by this instance
    pub async fn cleanup(&self) -> bool {
        info!("Cleaning up owned DNS records");
        let mut success = true;
        let mut zones = BTreeSet::new();

        let hints = std::iter::once(self.mail.hostname.as_str())
            .chain(self.mail.domains.iter().map(|d| d.name.as_str()));
        for hint in hints {
            match self.zone_id(hint).await {
                Some(zone_id) => {
                    zones.insert(zone_id);
                }
                None => warn!("No zone found for {}, nothing to clean up there", hint),
            }
        }

        for zone_id in zones {
            let guarded = self.registry.owned_markers(&zone_id).await;
            info!("Found {} owned record sets in zone {}", guarded.len(), zone_id);

            for (name, record_type) in guarded {
                if !self
                    .registry
                    .delete_owned_record(&zone_id, &name, record_type)
                    .await
                {
                    success = false;
                }
            }
        }

        success
    }

    /// Owned records per configured domain
    pub async fn status(&self) -> StatusReport {
        let mut domains = BTreeMap::new();

        for domain in &self.mail.domains {
            let zone_id = self.zone_id(&domain.name).await;
            let records = match &zone_id {
                Some(zone_id) => self
                    .registry
                    .list_owned_records(zone_id)
                    .await
                    .into_iter()
                    .map(|r| RecordSummary {
                        content: truncate(&r.content, STATUS_CONTENT_LIMIT),
                        name: r.name,
                        record_type: r.record_type,
                    })
                    .collect(),
                None => Vec::new(),
            };
            domains.insert(domain.name.clone(), DomainStatus { zone_id, records });
        }

        StatusReport {
            owner_id: self.registry.owner_id().to_string(),
            domains,
        }
    }

    async fn ensure(&self, zone_id: &str, desired: &DesiredRecord) -> bool {
        debug!("Ensuring {} record {}", desired.kind, desired.record.name);
        self.registry.ensure_record(zone_id, &desired.record).await
    }

    async fn check(&self, zone_id: &str, desired: &DesiredRecord) -> Option<String> {
        let record = &desired.record;
        let existing = self
            .registry
            .list(zone_id, Some(record.record_type), Some(&record.name))
            .await;

        match select_existing(&existing, record) {
            None => Some(format!("{} record for {} missing", desired.kind, record.name)),
            Some(current) if current.content != record.content => Some(match desired.kind {
                RecordKind::A | RecordKind::Mx => format!(
                    "{} record {}: {} != {}",
                    desired.kind, record.name, current.content, record.content
                ),
                _ => format!("{} record {} mismatch", desired.kind, record.name),
            }),
            Some(_) => None,
        }
    }

    async fn ensure_ptr(&self, target: &PtrTarget) -> bool {
        let Some(provider) = &self.ptr_provider else {
            warn!(
                "PTR management enabled but no PTR provider is available ({:?}), skipping",
                self.ptr_config.provider
            );
            return true;
        };

        match provider.get_ptr(target.ip).await {
            Ok(Some(current)) if current.trim_end_matches('.') == target.hostname => {
                debug!("PTR for {} already points to {}", target.ip, target.hostname);
                return true;
            }
            Ok(current) => info!(
                "Setting PTR for {}: {} -> {}",
                target.ip,
                current.as_deref().unwrap_or("<none>"),
                target.hostname
            ),
            Err(e) => {
                error!(
                    "Reading PTR for {} from {} failed: {}",
                    target.ip,
                    provider.provider_name(),
                    e
                );
                return false;
            }
        }

        if self.registry.is_dry_run() {
            info!("[dry-run] Would set PTR {} -> {}", target.ip, target.hostname);
            return true;
        }

        match provider.set_ptr(target.ip, &target.hostname).await {
            Ok(()) => {
                info!("PTR for {} set to {}", target.ip, target.hostname);
                true
            }
            Err(e) => {
                error!("Setting PTR for {} failed: {}", target.ip, e);
                false
            }
        }
    }

    async fn fetch_dkim(&self) -> BTreeMap<String, String> {
        let mut dkim = BTreeMap::new();
        if !self.mail.create_dkim {
            return dkim;
        }

        for domain in &self.mail.domains {
            let name = domain.name.trim().trim_end_matches('.');
            match self.cluster.dkim_record(name).await {
                Ok(Some(content)) => {
                    dkim.insert(name.to_string(), content);
                }
                Ok(None) => warn!("No DKIM key found for {}, skipping its DKIM record", name),
                Err(e) => warn!("DKIM lookup for {} failed, skipping its DKIM record: {}", name, e),
            }
        }
        dkim
    }

    async fn zone_id(&self, domain: &str) -> Option<String> {
        let domain = domain.trim().trim_end_matches('.');
        if let Some(zone_id) = self.zones.lock().await.get(domain) {
            return Some(zone_id.clone());
        }

        let zone_id = self.registry.resolve_zone(domain).await?;
        self.zones
            .lock()
            .await
            .insert(domain.to_string(), zone_id.clone());
        Some(zone_id)
    }
}

fn truncate(content: &str, limit: usize) -> String {
    match content.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &content[..idx]),
        None => content.to_string(),
    }
}
