//! Ownership-tracked record operations
//!
//! [`OwnershipRegistry`] wraps any [`DnsProvider`] and implements the
//! marker protocol on top of its primitive operations:
//!
//! - a record is *owned* when a TXT marker `_<prefix>.<name>` with
//!   `heritage=mail-relay,owner=<owner_id>,record-type=<TYPE>` exists;
//! - owned records may be updated and deleted, foreign records are never
//!   touched;
//! - every record this registry creates gets a marker.
//!
//! Provider errors stop at this layer: each operation logs them and reports
//! a plain success flag or an empty listing.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::ProviderConfig;
use crate::record::{DnsRecord, OwnershipMarker, RecordType, unquote_txt};
use crate::traits::DnsProvider;

/// Ownership-aware wrapper around a DNS provider
pub struct OwnershipRegistry<P: DnsProvider + ?Sized> {
    provider: Arc<P>,
    config: ProviderConfig,
}

impl<P: DnsProvider + ?Sized> OwnershipRegistry<P> {
    /// Wrap a provider
    pub fn new(provider: Arc<P>, config: ProviderConfig) -> Self {
        Self { provider, config }
    }

    /// Ownership and write-policy settings
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Identifier written into markers
    pub fn owner_id(&self) -> &str {
        &self.config.owner_id
    }

    /// Whether mutations are only logged
    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// The wrapped provider
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Resolve the zone hosting `domain`, logging failures
    pub async fn resolve_zone(&self, domain: &str) -> Option<String> {
        match self.provider.resolve_zone(domain).await {
            Ok(zone) => zone,
            Err(e) => {
                error!(
                    "Zone lookup for {} failed on {}: {}",
                    domain,
                    self.provider.provider_name(),
                    e
                );
                None
            }
        }
    }

    /// List records, degrading failures to an empty list
    pub async fn list(
        &self,
        zone_id: &str,
        record_type: Option<RecordType>,
        name: Option<&str>,
    ) -> Vec<DnsRecord> {
        match self.provider.list_records(zone_id, record_type, name).await {
            Ok(records) => records,
            Err(e) => {
                error!(
                    "Listing records in zone {} failed (type: {:?}, name: {:?}, transient: {}): {}",
                    zone_id,
                    record_type,
                    name,
                    e.is_transient(),
                    e
                );
                Vec::new()
            }
        }
    }

    /// Make the provider hold `desired`
    ///
    /// Creates the record (and its marker) when absent, updates it when it
    /// is owned and its content differs, and refuses to touch it when it is
    /// not owned.
    ///
    /// # Returns
    ///
    /// `true` when the provider holds the desired record afterwards (or
    /// would, in dry-run mode); `false` on failure or ownership conflict.
    pub async fn ensure_record(&self, zone_id: &str, desired: &DnsRecord) -> bool {
        let existing = match self
            .provider
            .list_records(zone_id, Some(desired.record_type), Some(&desired.name))
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(
                    "Cannot ensure {} {}: listing existing records failed: {}",
                    desired.record_type, desired.name, e
                );
                return false;
            }
        };

        let Some(current) = select_existing(&existing, desired) else {
            return self.create_owned(zone_id, desired).await;
        };

        if !self
            .is_owned(zone_id, &desired.name, desired.record_type)
            .await
        {
            warn!(
                "{} record {} exists but is not owned by {}, leaving it untouched",
                desired.record_type, desired.name, self.config.owner_id
            );
            return false;
        }

        if current.content == desired.content {
            debug!(
                "{} record {} already up to date",
                desired.record_type, desired.name
            );
            return true;
        }

        info!(
            "Updating {} record {}: {} -> {}",
            desired.record_type, desired.name, current.content, desired.content
        );

        if self.config.dry_run {
            info!(
                "[dry-run] Would update {} record {} to {}",
                desired.record_type, desired.name, desired.content
            );
            return true;
        }

        let Some(provider_id) = current.provider_id.clone() else {
            error!(
                "{} record {} has no provider id, cannot update",
                desired.record_type, desired.name
            );
            return false;
        };

        let mut record = desired.clone();
        record.provider_id = Some(provider_id);

        match self.provider.update_record(zone_id, &record).await {
            Ok(()) => {
                info!("Updated {} record {}", record.record_type, record.name);
                true
            }
            Err(e) => {
                error!(
                    "Failed to update {} record {}: {}",
                    record.record_type, record.name, e
                );
                false
            }
        }
    }

    /// Delete an owned record and its marker
    ///
    /// Absent records count as deleted. Records without our marker are left
    /// alone and reported as failure.
    pub async fn delete_owned_record(
        &self,
        zone_id: &str,
        name: &str,
        record_type: RecordType,
    ) -> bool {
        let existing = match self
            .provider
            .list_records(zone_id, Some(record_type), Some(name))
            .await
        {
            Ok(records) => owned_candidates(records),
            Err(e) => {
                error!(
                    "Cannot delete {} {}: listing existing records failed: {}",
                    record_type, name, e
                );
                return false;
            }
        };

        if existing.is_empty() {
            debug!("{} record {} already absent", record_type, name);
            if self.config.dry_run {
                return true;
            }
            // Drop a marker left behind by a record removed out of band.
            return self.delete_ownership(zone_id, name, record_type).await;
        }

        if !self.is_owned(zone_id, name, record_type).await {
            warn!(
                "{} record {} is not owned by {}, not deleting",
                record_type, name, self.config.owner_id
            );
            return false;
        }

        if self.config.dry_run {
            for record in &existing {
                info!("[dry-run] Would delete {}", record);
            }
            return true;
        }

        let mut success = true;
        for record in &existing {
            let Some(provider_id) = record.provider_id.as_deref() else {
                error!("Cannot delete {}: no provider id", record);
                success = false;
                continue;
            };
            match self.provider.delete_record(zone_id, provider_id).await {
                Ok(()) => info!("Deleted {}", record),
                Err(e) => {
                    error!("Failed to delete {}: {}", record, e);
                    success = false;
                }
            }
        }

        // Keep the marker while any guarded record survives.
        if success {
            success = self.delete_ownership(zone_id, name, record_type).await;
        }

        success
    }

    /// `(name, type)` pairs guarded by markers of this owner, in listing order
    pub async fn owned_markers(&self, zone_id: &str) -> Vec<(String, RecordType)> {
        let prefix = &self.config.txt_prefix;
        let mut seen = HashSet::new();
        let mut guarded = Vec::new();

        for marker_record in self.list(zone_id, Some(RecordType::Txt), None).await {
            let Some(name) = OwnershipMarker::guarded_name(prefix, &marker_record.name) else {
                continue;
            };
            let Some(marker) = OwnershipMarker::parse(&marker_record.content) else {
                continue;
            };
            if !marker.is_owned_by(&self.config.owner_id) {
                continue;
            }
            let key = (name.to_string(), marker.record_type);
            if seen.insert(key.clone()) {
                guarded.push(key);
            }
        }

        guarded
    }

    /// Records guarded by markers of this owner
    pub async fn list_owned_records(&self, zone_id: &str) -> Vec<DnsRecord> {
        let mut owned = Vec::new();
        for (name, record_type) in self.owned_markers(zone_id).await {
            let records = self.list(zone_id, Some(record_type), Some(&name)).await;
            owned.extend(owned_candidates(records));
        }
        owned
    }

    /// Whether `(name, record_type)` carries a marker of this owner
    ///
    /// Marker lookup failures count as "not owned".
    pub async fn is_owned(&self, zone_id: &str, name: &str, record_type: RecordType) -> bool {
        let marker_name = OwnershipMarker::record_name(&self.config.txt_prefix, name);
        let markers = match self
            .provider
            .list_records(zone_id, Some(RecordType::Txt), Some(&marker_name))
            .await
        {
            Ok(markers) => markers,
            Err(e) => {
                warn!("Ownership lookup for {} failed: {}", name, e);
                return false;
            }
        };

        markers
            .iter()
            .filter_map(|m| OwnershipMarker::parse(&m.content))
            .any(|m| m.is_owned_by(&self.config.owner_id) && m.record_type == record_type)
    }

    async fn create_owned(&self, zone_id: &str, desired: &DnsRecord) -> bool {
        info!("Creating {}", desired);

        if self.config.dry_run {
            info!("[dry-run] Would create {} with ownership marker", desired);
            return true;
        }

        match self.provider.create_record(zone_id, desired).await {
            Ok(id) => debug!("Created {} (id: {})", desired, id),
            Err(e) => {
                error!("Failed to create {}: {}", desired, e);
                return false;
            }
        }

        if !self.set_ownership(zone_id, desired).await {
            error!(
                "Created {} but could not attach its ownership marker",
                desired
            );
            return false;
        }

        true
    }

    async fn set_ownership(&self, zone_id: &str, record: &DnsRecord) -> bool {
        let marker_name = OwnershipMarker::record_name(&self.config.txt_prefix, &record.name);
        let content = OwnershipMarker::new(&self.config.owner_id, record.record_type).content();

        let markers = match self
            .provider
            .list_records(zone_id, Some(RecordType::Txt), Some(&marker_name))
            .await
        {
            Ok(markers) => markers,
            Err(e) => {
                error!("Listing markers at {} failed: {}", marker_name, e);
                return false;
            }
        };

        let same_type = markers.into_iter().find(|m| {
            OwnershipMarker::parse(&m.content).is_some_and(|p| p.record_type == record.record_type)
        });

        let marker = DnsRecord::new(&marker_name, RecordType::Txt, content.clone())
            .with_ttl(self.config.default_ttl);

        match same_type {
            Some(existing) if unquote_txt(&existing.content) == content => true,
            Some(existing) => {
                let Some(provider_id) = existing.provider_id else {
                    error!("Marker {} has no provider id", marker_name);
                    return false;
                };
                let marker = marker.with_provider_id(provider_id);
                match self.provider.update_record(zone_id, &marker).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!("Failed to update marker {}: {}", marker_name, e);
                        false
                    }
                }
            }
            None => match self.provider.create_record(zone_id, &marker).await {
                Ok(_) => {
                    debug!("Created ownership marker {}", marker_name);
                    true
                }
                Err(e) => {
                    error!("Failed to create marker {}: {}", marker_name, e);
                    false
                }
            },
        }
    }

    async fn delete_ownership(&self, zone_id: &str, name: &str, record_type: RecordType) -> bool {
        let marker_name = OwnershipMarker::record_name(&self.config.txt_prefix, name);
        let markers = match self
            .provider
            .list_records(zone_id, Some(RecordType::Txt), Some(&marker_name))
            .await
        {
            Ok(markers) => markers,
            Err(e) => {
                error!("Listing markers at {} failed: {}", marker_name, e);
                return false;
            }
        };

        let mut success = true;
        for marker in markers {
            let ours = OwnershipMarker::parse(&marker.content).is_some_and(|m| {
                m.record_type == record_type && m.is_owned_by(&self.config.owner_id)
            });
            if !ours {
                continue;
            }
            let Some(provider_id) = marker.provider_id.as_deref() else {
                continue;
            };
            if let Err(e) = self.provider.delete_record(zone_id, provider_id).await {
                error!("Failed to delete marker {}: {}", marker_name, e);
                success = false;
            }
        }
        success
    }
}

/// Pick the existing record `desired` corresponds to
///
/// Records are matched in order of preference:
///
/// 1. a record with exactly the desired content;
/// 2. for TXT, the first record with the same `v=` tag (so an SPF record
///    never replaces a site-verification token at the same name);
/// 3. for other types, the first record returned by the provider.
pub fn select_existing<'a>(existing: &'a [DnsRecord], desired: &DnsRecord) -> Option<&'a DnsRecord> {
    if let Some(exact) = existing.iter().find(|r| r.content == desired.content) {
        return Some(exact);
    }

    if desired.record_type == RecordType::Txt {
        let tag = desired.txt_tag();
        return existing.iter().find(|r| r.txt_tag() == tag);
    }

    existing.first()
}

/// Records at one `(name, type)` that this system could have created
///
/// A marker guards a `(name, type)` pair, not a payload, so TXT records
/// only qualify when they are the mail-authentication payload published at
/// that name (see [`DnsRecord::is_mail_auth_txt`]). Other types always do.
pub fn owned_candidates(records: Vec<DnsRecord>) -> Vec<DnsRecord> {
    records
        .into_iter()
        .filter(|r| r.record_type != RecordType::Txt || r.is_mail_auth_txt())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txt(name: &str, content: &str) -> DnsRecord {
        DnsRecord::new(name, RecordType::Txt, content)
    }

    #[test]
    fn exact_content_wins() {
        let existing = vec![
            DnsRecord::new("mail.example.com", RecordType::A, "9.9.9.9"),
            DnsRecord::new("mail.example.com", RecordType::A, "1.2.3.4"),
        ];
        let desired = DnsRecord::new("mail.example.com", RecordType::A, "1.2.3.4");
        assert_eq!(select_existing(&existing, &desired).unwrap().content, "1.2.3.4");
    }

    #[test]
    fn first_record_for_non_txt() {
        let existing = vec![
            DnsRecord::new("mail.example.com", RecordType::A, "9.9.9.9"),
            DnsRecord::new("mail.example.com", RecordType::A, "8.8.8.8"),
        ];
        let desired = DnsRecord::new("mail.example.com", RecordType::A, "1.2.3.4");
        assert_eq!(select_existing(&existing, &desired).unwrap().content, "9.9.9.9");
    }

    #[test]
    fn txt_matches_by_tag() {
        let existing = vec![
            txt("example.com", "google-site-verification=abc"),
            txt("example.com", "v=spf1 ip4:9.9.9.9 ~all"),
        ];
        let desired = txt("example.com", "v=spf1 ip4:1.2.3.4 ~all");
        assert_eq!(
            select_existing(&existing, &desired).unwrap().content,
            "v=spf1 ip4:9.9.9.9 ~all"
        );

        let unrelated = vec![txt("example.com", "google-site-verification=abc")];
        assert!(select_existing(&unrelated, &desired).is_none());
    }

    #[test]
    fn candidates_skip_foreign_txt() {
        let records = vec![
            txt("example.com", "google-site-verification=abc"),
            txt("example.com", "v=spf1 -all"),
        ];
        let candidates = owned_candidates(records);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].content, "v=spf1 -all");

        let lone = owned_candidates(vec![txt("s._domainkey.example.com", "k=rsa; p=abc")]);
        assert_eq!(lone.len(), 1);

        let foreign = owned_candidates(vec![txt("example.com", "google-site-verification=abc")]);
        assert!(foreign.is_empty());
    }
}
