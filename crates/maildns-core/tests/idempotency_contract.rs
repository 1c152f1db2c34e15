//! Contract Test: Idempotency
//!
//! Constraints verified:
//! - Re-applying an unchanged desired state performs no writes
//! - A second reconciler instance with the same owner sees its records as owned
//! - An address change rewrites only the records that depend on it
//!
//! If this test fails, every watch tick would hammer the DNS API.

mod common;

use common::*;
use maildns_core::record::{DnsRecord, RecordType};
use std::time::Duration;

#[tokio::test]
async fn second_apply_performs_no_writes() {
    let provider = MockDnsProvider::with_example_zone();
    let detector = ScriptedIpDetector::new(Some(ip("1.2.3.4")), None);
    let manager = manager(&provider, &detector, OWNER, false);

    assert!(manager.init_or_update(Duration::ZERO).await);
    let writes = provider.write_calls();
    assert!(writes > 0);

    assert!(manager.init_or_update(Duration::ZERO).await);
    assert_eq!(
        provider.write_calls(),
        writes,
        "Expected no writes for an unchanged desired state"
    );
}

#[tokio::test]
async fn restarted_instance_recognises_its_records() {
    let provider = MockDnsProvider::with_example_zone();
    let detector = ScriptedIpDetector::new(Some(ip("1.2.3.4")), None);

    {
        let first = manager(&provider, &detector, OWNER, false);
        assert!(first.init_or_update(Duration::ZERO).await);
    }
    let writes = provider.write_calls();

    let second = manager(&provider, &detector, OWNER, false);
    assert!(second.init_or_update(Duration::ZERO).await);
    assert_eq!(provider.write_calls(), writes);
}

#[tokio::test]
async fn address_change_updates_dependent_records_only() {
    let provider = MockDnsProvider::with_example_zone();
    let detector = ScriptedIpDetector::new(Some(ip("1.2.3.4")), None);
    let manager = manager(&provider, &detector, OWNER, false);

    assert!(manager.init_or_update(Duration::ZERO).await);
    let creates = provider.create_calls();

    detector.set(Some(ip("1.2.3.5")), None);
    assert!(manager.init_or_update(Duration::ZERO).await);

    // A and SPF change; MX and DMARC do not.
    assert_eq!(provider.update_calls(), 2);
    assert_eq!(provider.create_calls(), creates);
    assert_eq!(provider.find(ZONE, HOSTNAME, RecordType::A)[0].content, "1.2.3.5");
    assert_eq!(
        provider.find(ZONE, DOMAIN, RecordType::Txt)[0].content,
        "v=spf1 ip4:1.2.3.5 ~all"
    );
}

#[tokio::test]
async fn ensure_record_is_idempotent() {
    let provider = MockDnsProvider::with_example_zone();
    let registry = maildns_core::OwnershipRegistry::new(
        std::sync::Arc::new(provider.clone()),
        maildns_core::ProviderConfig::new(OWNER),
    );
    let record = DnsRecord::new("_dmarc.ex.com", RecordType::Txt, "v=DMARC1; p=none");

    assert!(registry.ensure_record(ZONE, &record).await);
    let writes = provider.write_calls();
    for _ in 0..3 {
        assert!(registry.ensure_record(ZONE, &record).await);
    }
    assert_eq!(provider.write_calls(), writes);
}
