//! Record model
//!
//! Value types for DNS records and the ownership markers that guard them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::Error;

/// Heritage value written into every ownership marker
pub const HERITAGE: &str = "mail-relay";

/// Default TTL for records built without an explicit TTL
pub const DEFAULT_TTL: u32 = 300;

/// DNS record types managed by the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    /// IPv4 address record
    A,
    /// IPv6 address record
    Aaaa,
    /// Mail exchanger
    Mx,
    /// Text record (SPF, DKIM, DMARC, ownership markers)
    Txt,
    /// Canonical name
    Cname,
}

impl RecordType {
    /// Wire name of the record type (e.g. "MX")
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Cname => "CNAME",
        }
    }

    /// Whether the provider-side proxy flag applies to this type
    pub fn supports_proxy(&self) -> bool {
        matches!(self, RecordType::A | RecordType::Cname)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            "MX" => Ok(RecordType::Mx),
            "TXT" => Ok(RecordType::Txt),
            "CNAME" => Ok(RecordType::Cname),
            other => Err(Error::invalid_input(format!("unsupported record type: {other}"))),
        }
    }
}

/// A DNS record as desired by the builder or as held by a provider
///
/// Identity is `(name, type, content)`: `ttl`, `priority`, `proxied` and
/// `provider_id` do not take part in equality or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Fully qualified name, without trailing dot
    pub name: String,
    /// Record type
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Record content (address, exchanger, or TXT payload)
    pub content: String,
    /// Time-to-live in seconds (at least 1)
    pub ttl: u32,
    /// MX preference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,
    /// Provider-side proxy flag (A/CNAME only)
    #[serde(default)]
    pub proxied: bool,
    /// Opaque provider identifier, present on records read back from a provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

impl DnsRecord {
    /// Create a record with the default TTL
    pub fn new(name: impl AsRef<str>, record_type: RecordType, content: impl Into<String>) -> Self {
        Self {
            name: normalize_name(name.as_ref()),
            record_type,
            content: content.into(),
            ttl: DEFAULT_TTL,
            priority: None,
            proxied: false,
            provider_id: None,
        }
    }

    /// Set the TTL (clamped to at least one second)
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl.max(1);
        self
    }

    /// Set the MX priority
    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the proxy flag
    pub fn with_proxied(mut self, proxied: bool) -> Self {
        self.proxied = proxied;
        self
    }

    /// Attach the provider identifier
    pub fn with_provider_id(mut self, id: impl Into<String>) -> Self {
        self.provider_id = Some(id.into());
        self
    }

    /// Leading `v=` tag of a TXT payload, e.g. `v=spf1` or `v=DMARC1`
    pub fn txt_tag(&self) -> Option<String> {
        if self.record_type != RecordType::Txt {
            return None;
        }
        txt_tag(&self.content)
    }

    /// Whether this is a TXT payload of the kind published at its name
    ///
    /// `_dmarc.` names hold `v=DMARC1`, `._domainkey.` names hold DKIM keys
    /// (`v=DKIM1`, or untagged with a `p=` key tag), anything else holds
    /// `v=spf1`.
    pub fn is_mail_auth_txt(&self) -> bool {
        if self.record_type != RecordType::Txt {
            return false;
        }
        let tag = self.txt_tag();
        if self.name.starts_with("_dmarc.") {
            tag.as_deref() == Some("v=dmarc1")
        } else if self.name.contains("._domainkey.") {
            match tag.as_deref() {
                Some(tag) => tag == "v=dkim1",
                None => has_key_tag(&self.content),
            }
        } else {
            tag.as_deref() == Some("v=spf1")
        }
    }
}

impl PartialEq for DnsRecord {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.record_type == other.record_type
            && self.content == other.content
    }
}

impl Eq for DnsRecord {}

impl Hash for DnsRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.record_type.hash(state);
        self.content.hash(state);
    }
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.record_type, self.name, self.content)
    }
}

/// Strip the trailing root dot and surrounding whitespace from a name
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_string()
}

/// Remove one layer of surrounding double quotes from TXT content
pub fn unquote_txt(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed)
}

/// Leading `v=` tag of a TXT payload, lowercased
pub fn txt_tag(content: &str) -> Option<String> {
    let content = unquote_txt(content);
    if !content.to_ascii_lowercase().starts_with("v=") {
        return None;
    }
    let tag = content
        .split(|c: char| c == ';' || c.is_whitespace())
        .next()
        .unwrap_or_default();
    Some(tag.to_ascii_lowercase())
}

fn has_key_tag(content: &str) -> bool {
    unquote_txt(content)
        .split(';')
        .any(|tag| tag.trim().to_ascii_lowercase().starts_with("p="))
}

/// Candidate zone names for a domain, most specific first
///
/// `mail.example.com` yields `mail.example.com` then `example.com`; a
/// single label is never offered as a zone.
pub fn zone_candidates(domain: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut current = domain.trim().trim_end_matches('.');
    while current.contains('.') {
        candidates.push(current.to_string());
        match current.split_once('.') {
            Some((_, rest)) => current = rest,
            None => break,
        }
    }
    candidates
}

/// An ownership marker: the TXT payload asserting who created a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipMarker {
    /// Owner identifier of the creating instance
    pub owner: String,
    /// Type of the record this marker guards
    pub record_type: RecordType,
}

impl OwnershipMarker {
    /// Create a marker for a record type
    pub fn new(owner: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            owner: owner.into(),
            record_type,
        }
    }

    /// Marker record name for a guarded record name
    pub fn record_name(txt_prefix: &str, name: &str) -> String {
        format!("_{}.{}", txt_prefix, normalize_name(name))
    }

    /// Guarded record name for a marker record name, if it carries the prefix
    pub fn guarded_name<'a>(txt_prefix: &str, marker_name: &'a str) -> Option<&'a str> {
        marker_name
            .strip_prefix('_')
            .and_then(|rest| rest.strip_prefix(txt_prefix))
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|rest| !rest.is_empty())
    }

    /// TXT payload for this marker
    pub fn content(&self) -> String {
        format!(
            "heritage={},owner={},record-type={}",
            HERITAGE, self.owner, self.record_type
        )
    }

    /// Parse a marker payload
    ///
    /// Returns `None` for anything that is not a mail-relay marker; parsing
    /// never fails loudly. A missing `record-type` defaults to `A`, and an
    /// unknown type makes the marker invalid.
    pub fn parse(content: &str) -> Option<Self> {
        let mut heritage = None;
        let mut owner = None;
        let mut record_type = None;

        for part in unquote_txt(content).split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "heritage" => heritage = Some(value.trim()),
                "owner" => owner = Some(value.trim()),
                "record-type" => record_type = Some(value.trim()),
                _ => {}
            }
        }

        if heritage != Some(HERITAGE) {
            return None;
        }

        let record_type = match record_type {
            Some(raw) => raw.parse().ok()?,
            None => RecordType::A,
        };

        Some(Self {
            owner: owner.unwrap_or_default().to_string(),
            record_type,
        })
    }

    /// Whether this marker belongs to `owner_id`
    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner == owner_id
    }
}
