// # DNS Provider Trait
//
// Defines the primitive record operations a DNS backend must offer.
//
// ## Implementations
//
// - Cloudflare: `maildns-provider-cloudflare` crate
//
// The ownership protocol (`ensure_record`, `delete_owned_record`,
// `list_owned_records`) is built once on top of this trait in
// `crate::ownership` and is never re-implemented per provider.
//
// ## Usage
//
// ```rust,ignore
// use maildns_core::{DnsProvider, DnsRecord, RecordType};
//
// async fn publish(provider: &dyn DnsProvider) -> maildns_core::Result<()> {
//     let zone_id = provider
//         .resolve_zone("mail.example.com")
//         .await?
//         .expect("zone exists");
//     let record = DnsRecord::new("mail.example.com", RecordType::A, "1.2.3.4");
//     provider.create_record(&zone_id, &record).await?;
//     Ok(())
// }
// ```

use async_trait::async_trait;

use crate::record::{DnsRecord, RecordType};

/// Trait for DNS provider implementations
///
/// Every method performs provider I/O only: no retries, no ownership
/// decisions, no dry-run handling. Those belong to
/// [`OwnershipRegistry`](crate::ownership::OwnershipRegistry).
///
/// An `Err` is the definite failure outcome of the operation. Callers in
/// this crate log it and treat the operation as failed; it never aborts a
/// reconciliation run.
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Find the zone that hosts `domain`
    ///
    /// Implementations walk the domain upward (see
    /// [`zone_candidates`](crate::record::zone_candidates)) and cache
    /// successful lookups under both the requested and the matched name.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(zone_id))`: The hosting zone
    /// - `Ok(None)`: No candidate matched
    /// - `Err(Error)`: Lookup could not be performed
    async fn resolve_zone(&self, domain: &str) -> Result<Option<String>, crate::Error>;

    /// List records in a zone, optionally filtered by type and name
    ///
    /// Pagination is handled inside the implementation. A failure on any
    /// page fails the whole listing.
    ///
    /// # Parameters
    ///
    /// - `zone_id`: Zone to list
    /// - `record_type`: Only records of this type
    /// - `name`: Only records with this exact name
    async fn list_records(
        &self,
        zone_id: &str,
        record_type: Option<RecordType>,
        name: Option<&str>,
    ) -> Result<Vec<DnsRecord>, crate::Error>;

    /// Create a record
    ///
    /// # Returns
    ///
    /// - `Ok(String)`: Provider identifier of the created record
    /// - `Err(Error)`: If creation failed
    async fn create_record(&self, zone_id: &str, record: &DnsRecord)
    -> Result<String, crate::Error>;

    /// Replace an existing record
    ///
    /// `record.provider_id` must be set; implementations return
    /// [`Error::InvalidInput`](crate::Error::InvalidInput) otherwise.
    async fn update_record(&self, zone_id: &str, record: &DnsRecord) -> Result<(), crate::Error>;

    /// Delete a record by provider identifier
    async fn delete_record(&self, zone_id: &str, provider_id: &str) -> Result<(), crate::Error>;

    /// Check the configured credentials without touching any record
    ///
    /// The default accepts any credentials.
    async fn verify_credentials(&self) -> Result<(), crate::Error> {
        Ok(())
    }

    /// Get the provider name (for logging/debugging)
    fn provider_name(&self) -> &'static str;
}

/// Helper trait for constructing DNS providers from settings
///
/// Any `Fn(&ProviderSettings) -> Result<Arc<dyn DnsProvider>>` closure is a
/// factory, so registration tables can hold plain constructor closures.
pub trait DnsProviderFactory: Send + Sync {
    /// Create a DnsProvider instance from settings
    fn create(
        &self,
        settings: &crate::config::ProviderSettings,
    ) -> Result<std::sync::Arc<dyn DnsProvider>, crate::Error>;
}

impl<F> DnsProviderFactory for F
where
    F: Fn(&crate::config::ProviderSettings) -> Result<std::sync::Arc<dyn DnsProvider>, crate::Error>
        + Send
        + Sync,
{
    fn create(
        &self,
        settings: &crate::config::ProviderSettings,
    ) -> Result<std::sync::Arc<dyn DnsProvider>, crate::Error> {
        self(settings)
    }
}
