//! Desired-state builder
//!
//! Derives the record set the relay should publish from its mail
//! configuration and its detected addresses. Everything here is pure: the
//! caller fetches DKIM payloads beforehand and passes them in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

use crate::config::{MailConfig, PtrConfig};
use crate::record::{DnsRecord, RecordType};
use crate::traits::DetectedState;

/// MX preference used for the relay
pub const MX_PRIORITY: u16 = 10;

/// Role a desired record plays in the mail setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Relay hostname address
    A,
    /// Mail exchanger
    Mx,
    /// Sender Policy Framework
    Spf,
    /// DomainKeys Identified Mail public key
    Dkim,
    /// DMARC policy
    Dmarc,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecordKind::A => "A",
            RecordKind::Mx => "MX",
            RecordKind::Spf => "SPF",
            RecordKind::Dkim => "DKIM",
            RecordKind::Dmarc => "DMARC",
        };
        f.write_str(label)
    }
}

/// A record the relay should publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRecord {
    /// Role of the record
    pub kind: RecordKind,
    /// The record itself
    pub record: DnsRecord,
}

/// Records that live in the same zone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordGroup {
    /// Name the hosting zone is resolved from
    pub zone_hint: String,
    /// Records to publish in that zone
    pub records: Vec<DesiredRecord>,
}

/// PTR assignment for the relay's sending address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtrTarget {
    /// Address whose reverse record is set
    pub ip: IpAddr,
    /// Hostname the address should resolve back to
    pub hostname: String,
}

/// Everything the relay should publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    /// Forward records, grouped by zone
    pub groups: Vec<RecordGroup>,
    /// Reverse record, when PTR management is enabled
    pub ptr: Option<PtrTarget>,
}

impl DesiredState {
    /// Build the desired state
    ///
    /// # Parameters
    ///
    /// - `mail`: Hostname, domains and per-type switches
    /// - `ptr`: Reverse DNS settings
    /// - `detected`: Current network identity
    /// - `dkim`: DKIM TXT payloads keyed by domain; domains without an
    ///   entry get no DKIM record
    pub fn build(
        mail: &MailConfig,
        ptr: &PtrConfig,
        detected: &DetectedState,
        dkim: &BTreeMap<String, String>,
    ) -> Self {
        let mut groups = Vec::new();

        if mail.create_a {
            let record = DnsRecord::new(
                &mail.hostname,
                RecordType::A,
                detected.incoming_ip.to_string(),
            )
            .with_ttl(mail.ttl);
            groups.push(RecordGroup {
                zone_hint: record.name.clone(),
                records: vec![DesiredRecord {
                    kind: RecordKind::A,
                    record,
                }],
            });
        }

        for domain in &mail.domains {
            let name = domain.name.trim().trim_end_matches('.');
            let mut records = Vec::new();

            if mail.create_mx {
                records.push(DesiredRecord {
                    kind: RecordKind::Mx,
                    record: DnsRecord::new(name, RecordType::Mx, mail.hostname.trim_end_matches('.'))
                        .with_ttl(mail.ttl)
                        .with_priority(MX_PRIORITY),
                });
            }

            if mail.create_spf {
                records.push(DesiredRecord {
                    kind: RecordKind::Spf,
                    record: DnsRecord::new(
                        name,
                        RecordType::Txt,
                        build_spf_record(&detected.all_ips, &mail.spf_policy),
                    )
                    .with_ttl(mail.ttl),
                });
            }

            if mail.create_dkim
                && let Some(content) = dkim.get(name)
            {
                records.push(DesiredRecord {
                    kind: RecordKind::Dkim,
                    record: DnsRecord::new(
                        dkim_record_name(&domain.dkim_selector, name),
                        RecordType::Txt,
                        content.clone(),
                    )
                    .with_ttl(mail.ttl),
                });
            }

            if mail.create_dmarc {
                records.push(DesiredRecord {
                    kind: RecordKind::Dmarc,
                    record: DnsRecord::new(
                        dmarc_record_name(name),
                        RecordType::Txt,
                        build_dmarc_record(
                            name,
                            &mail.dmarc_policy,
                            mail.dmarc_pct,
                            mail.dmarc_rua.as_deref(),
                        ),
                    )
                    .with_ttl(mail.ttl),
                });
            }

            if !records.is_empty() {
                groups.push(RecordGroup {
                    zone_hint: name.to_string(),
                    records,
                });
            }
        }

        let ptr = ptr.enabled.then(|| PtrTarget {
            ip: detected.ptr_ip(),
            hostname: ptr
                .hostname
                .clone()
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| mail.hostname.clone()),
        });

        Self { groups, ptr }
    }

    /// All forward records, in application order
    pub fn records(&self) -> impl Iterator<Item = &DesiredRecord> {
        self.groups.iter().flat_map(|g| g.records.iter())
    }
}

/// SPF payload authorising `ips`
///
/// Addresses are emitted in sorted order so the payload is identical across
/// runs regardless of discovery order.
pub fn build_spf_record(ips: &BTreeSet<IpAddr>, policy: &str) -> String {
    let mut spf = String::from("v=spf1");
    for ip in ips {
        let mechanism = match ip {
            IpAddr::V4(_) => "ip4",
            IpAddr::V6(_) => "ip6",
        };
        spf.push_str(&format!(" {mechanism}:{ip}"));
    }
    spf.push(' ');
    spf.push_str(policy);
    spf
}

/// DMARC payload for a domain
pub fn build_dmarc_record(domain: &str, policy: &str, pct: Option<u8>, rua: Option<&str>) -> String {
    let mut dmarc = format!("v=DMARC1; p={policy}");
    if let Some(pct) = pct {
        dmarc.push_str(&format!("; pct={pct}"));
    }
    let rua = rua
        .filter(|r| !r.trim().is_empty())
        .map(|r| r.trim().trim_start_matches("mailto:").to_string())
        .unwrap_or_else(|| format!("postmaster@{domain}"));
    dmarc.push_str(&format!("; rua=mailto:{rua}"));
    dmarc
}

/// Name of the DKIM key record
pub fn dkim_record_name(selector: &str, domain: &str) -> String {
    format!("{selector}._domainkey.{domain}")
}

/// Name of the DMARC policy record
pub fn dmarc_record_name(domain: &str) -> String {
    format!("_dmarc.{domain}")
}
