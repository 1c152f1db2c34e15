//! Test doubles and common utilities for contract tests
//!
//! The mock provider is a small in-memory DNS backend: it keeps records per
//! zone, hands out ids, and counts every mutation so tests can assert on
//! exactly what reached the "API".

#![allow(dead_code)]

use async_trait::async_trait;
use maildns_core::config::{DomainConfig, MailConfig, ProviderConfig};
use maildns_core::error::{Error, Result};
use maildns_core::record::{DnsRecord, OwnershipMarker, RecordType, zone_candidates};
use maildns_core::traits::{ClusterInfo, DnsProvider, IpDetector, PtrProvider, ServiceType};
use maildns_core::DnsManager;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const OWNER: &str = "default/mail-relay";
pub const ZONE: &str = "zone-ex";
pub const HOSTNAME: &str = "mail.ex.com";
pub const DOMAIN: &str = "ex.com";
pub const MARKER_PREFIX: &str = "mail-relay-owner";

pub fn ip(raw: &str) -> IpAddr {
    raw.parse().expect("valid test address")
}

/// In-memory DNS provider; clones share state and counters
#[derive(Clone, Default)]
pub struct MockDnsProvider {
    inner: Arc<MockDnsState>,
}

#[derive(Default)]
struct MockDnsState {
    zones: Mutex<HashMap<String, String>>,
    records: Mutex<Vec<(String, DnsRecord)>>,
    next_id: AtomicUsize,
    list_calls: AtomicUsize,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    fail_listing: AtomicBool,
    fail_marker_creates: AtomicBool,
}

impl MockDnsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider hosting `ex.com` as [`ZONE`]
    pub fn with_example_zone() -> Self {
        let provider = Self::new();
        provider.add_zone(DOMAIN, ZONE);
        provider
    }

    pub fn add_zone(&self, domain: &str, zone_id: &str) {
        self.inner
            .zones
            .lock()
            .unwrap()
            .insert(domain.to_string(), zone_id.to_string());
    }

    /// Insert a record without counting it as a write
    pub fn seed(&self, zone_id: &str, record: DnsRecord) -> String {
        let id = self.next_id();
        self.inner
            .records
            .lock()
            .unwrap()
            .push((zone_id.to_string(), record.with_provider_id(id.clone())));
        id
    }

    /// Seed a marker for `owner` guarding `(name, record_type)`
    pub fn seed_marker(&self, zone_id: &str, owner: &str, name: &str, record_type: RecordType) {
        self.seed(
            zone_id,
            DnsRecord::new(
                OwnershipMarker::record_name(MARKER_PREFIX, name),
                RecordType::Txt,
                OwnershipMarker::new(owner, record_type).content(),
            ),
        );
    }

    /// Remove data records at `(name, type)` without counting it as a write
    pub fn remove_out_of_band(&self, zone_id: &str, name: &str, record_type: RecordType, content: &str) {
        self.inner.records.lock().unwrap().retain(|(zone, r)| {
            !(zone == zone_id && r.name == name && r.record_type == record_type && r.content == content)
        });
    }

    /// Rewrite record content at `(name, type)` without counting it as a write
    pub fn edit_out_of_band(&self, zone_id: &str, name: &str, record_type: RecordType, content: &str) {
        for (zone, record) in self.inner.records.lock().unwrap().iter_mut() {
            if zone == zone_id && record.name == name && record.record_type == record_type {
                record.content = content.to_string();
            }
        }
    }

    pub fn records(&self, zone_id: &str) -> Vec<DnsRecord> {
        self.inner
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|(zone, _)| zone == zone_id)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Records other than ownership markers
    pub fn data_records(&self, zone_id: &str) -> Vec<DnsRecord> {
        self.records(zone_id)
            .into_iter()
            .filter(|r| OwnershipMarker::parse(&r.content).is_none())
            .collect()
    }

    pub fn markers(&self, zone_id: &str) -> Vec<DnsRecord> {
        self.records(zone_id)
            .into_iter()
            .filter(|r| OwnershipMarker::parse(&r.content).is_some())
            .collect()
    }

    pub fn find(&self, zone_id: &str, name: &str, record_type: RecordType) -> Vec<DnsRecord> {
        self.records(zone_id)
            .into_iter()
            .filter(|r| r.name == name && r.record_type == record_type)
            .collect()
    }

    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.inner.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.inner.update_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.inner.delete_calls.load(Ordering::SeqCst)
    }

    /// Total mutating calls
    pub fn write_calls(&self) -> usize {
        self.create_calls() + self.update_calls() + self.delete_calls()
    }

    pub fn fail_listing(&self, fail: bool) {
        self.inner.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn fail_marker_creates(&self, fail: bool) {
        self.inner.fail_marker_creates.store(fail, Ordering::SeqCst);
    }

    fn next_id(&self) -> String {
        format!("rec-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl DnsProvider for MockDnsProvider {
    async fn resolve_zone(&self, domain: &str) -> Result<Option<String>> {
        let zones = self.inner.zones.lock().unwrap();
        Ok(zone_candidates(domain)
            .iter()
            .find_map(|candidate| zones.get(candidate).cloned()))
    }

    async fn list_records(
        &self,
        zone_id: &str,
        record_type: Option<RecordType>,
        name: Option<&str>,
    ) -> Result<Vec<DnsRecord>> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_listing.load(Ordering::SeqCst) {
            return Err(Error::http("connection reset"));
        }
        Ok(self
            .records(zone_id)
            .into_iter()
            .filter(|r| record_type.is_none_or(|t| r.record_type == t))
            .filter(|r| name.is_none_or(|n| r.name == n))
            .collect())
    }

    async fn create_record(&self, zone_id: &str, record: &DnsRecord) -> Result<String> {
        self.inner.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_marker_creates.load(Ordering::SeqCst)
            && OwnershipMarker::parse(&record.content).is_some()
        {
            return Err(Error::dns_provider("marker rejected"));
        }
        let id = self.next_id();
        self.inner
            .records
            .lock()
            .unwrap()
            .push((zone_id.to_string(), record.clone().with_provider_id(id.clone())));
        Ok(id)
    }

    async fn update_record(&self, zone_id: &str, record: &DnsRecord) -> Result<()> {
        self.inner.update_calls.fetch_add(1, Ordering::SeqCst);
        let id = record
            .provider_id
            .clone()
            .ok_or_else(|| Error::invalid_input("missing provider id"))?;
        let mut records = self.inner.records.lock().unwrap();
        let slot = records
            .iter_mut()
            .find(|(zone, r)| zone == zone_id && r.provider_id.as_deref() == Some(id.as_str()))
            .ok_or_else(|| Error::not_found(format!("record {id}")))?;
        slot.1 = record.clone();
        Ok(())
    }

    async fn delete_record(&self, zone_id: &str, provider_id: &str) -> Result<()> {
        self.inner.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut records = self.inner.records.lock().unwrap();
        let before = records.len();
        records.retain(|(zone, r)| !(zone == zone_id && r.provider_id.as_deref() == Some(provider_id)));
        if records.len() == before {
            return Err(Error::not_found(format!("record {provider_id}")));
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

/// IP detector whose answers the test controls
#[derive(Clone, Default)]
pub struct ScriptedIpDetector {
    inner: Arc<Mutex<ScriptedIps>>,
    incoming_calls: Arc<AtomicUsize>,
}

#[derive(Default)]
struct ScriptedIps {
    incoming: Option<IpAddr>,
    outbound: Option<IpAddr>,
}

impl ScriptedIpDetector {
    pub fn new(incoming: Option<IpAddr>, outbound: Option<IpAddr>) -> Self {
        let detector = Self::default();
        detector.set(incoming, outbound);
        detector
    }

    pub fn set(&self, incoming: Option<IpAddr>, outbound: Option<IpAddr>) {
        let mut ips = self.inner.lock().unwrap();
        ips.incoming = incoming;
        ips.outbound = outbound;
    }

    pub fn incoming_calls(&self) -> usize {
        self.incoming_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IpDetector for ScriptedIpDetector {
    async fn incoming_ip(&self, _wait: Duration, _cancel: &CancellationToken) -> Option<IpAddr> {
        self.incoming_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().unwrap().incoming
    }

    async fn outbound_ip(&self) -> Option<IpAddr> {
        self.inner.lock().unwrap().outbound
    }

    async fn all_ips(&self, _wait: Duration, _cancel: &CancellationToken) -> BTreeSet<IpAddr> {
        let ips = self.inner.lock().unwrap();
        ips.incoming.into_iter().chain(ips.outbound).collect()
    }
}

/// Cluster with a fixed set of DKIM payloads
#[derive(Default)]
pub struct StaticCluster {
    dkim: BTreeMap<String, String>,
}

impl StaticCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dkim(mut self, domain: &str, content: &str) -> Self {
        self.dkim.insert(domain.to_string(), content.to_string());
        self
    }
}

#[async_trait]
impl ClusterInfo for StaticCluster {
    async fn dkim_record(&self, domain: &str) -> Result<Option<String>> {
        Ok(self.dkim.get(domain).cloned())
    }

    async fn loadbalancer_ips(&self) -> Result<Vec<IpAddr>> {
        Ok(Vec::new())
    }

    async fn service_type(&self) -> Result<Option<ServiceType>> {
        Ok(Some(ServiceType::ClusterIp))
    }

    async fn node_external_ip(&self) -> Result<Option<IpAddr>> {
        Ok(None)
    }
}

/// PTR provider backed by a map
#[derive(Clone, Default)]
pub struct MockPtrProvider {
    ptrs: Arc<Mutex<HashMap<IpAddr, String>>>,
    set_calls: Arc<AtomicUsize>,
}

impl MockPtrProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ptr(&self, ip: IpAddr) -> Option<String> {
        self.ptrs.lock().unwrap().get(&ip).cloned()
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PtrProvider for MockPtrProvider {
    async fn get_ptr(&self, ip: IpAddr) -> Result<Option<String>> {
        Ok(self.ptr(ip))
    }

    async fn set_ptr(&self, ip: IpAddr, hostname: &str) -> Result<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.ptrs.lock().unwrap().insert(ip, hostname.to_string());
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "mock-ptr"
    }
}

/// `mail.ex.com` relaying for `ex.com`
pub fn example_mail_config() -> MailConfig {
    MailConfig::new(HOSTNAME, vec![DomainConfig::new(DOMAIN)])
}

pub fn manager(
    provider: &MockDnsProvider,
    detector: &ScriptedIpDetector,
    owner: &str,
    dry_run: bool,
) -> DnsManager {
    manager_with(provider, detector, ProviderConfig::new(owner).with_dry_run(dry_run), StaticCluster::new())
}

pub fn manager_with(
    provider: &MockDnsProvider,
    detector: &ScriptedIpDetector,
    config: ProviderConfig,
    cluster: StaticCluster,
) -> DnsManager {
    DnsManager::new(
        Arc::new(provider.clone()),
        config,
        example_mail_config(),
        Arc::new(cluster),
        Arc::new(detector.clone()),
    )
}
