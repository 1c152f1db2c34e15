// # PTR Provider Trait
//
// Reverse DNS is owned by whoever owns the IP address (a cloud or hosting
// API), not by the DNS zone provider, so it gets its own small trait.
//
// ## Implementations
//
// - Hetzner Cloud and Hetzner Robot: `maildns-ptr-hetzner` crate

use async_trait::async_trait;
use std::net::IpAddr;

/// Trait for reverse DNS implementations
#[async_trait]
pub trait PtrProvider: Send + Sync {
    /// Current PTR target of `ip`
    ///
    /// # Returns
    ///
    /// - `Ok(Some(hostname))`: PTR is set
    /// - `Ok(None)`: The IP is known but has no PTR
    /// - `Err(Error)`: Lookup failed or the IP is not managed by this account
    async fn get_ptr(&self, ip: IpAddr) -> Result<Option<String>, crate::Error>;

    /// Point the PTR of `ip` at `hostname`
    ///
    /// Dry-run handling is done by the caller; this always writes.
    async fn set_ptr(&self, ip: IpAddr, hostname: &str) -> Result<(), crate::Error>;

    /// Check the configured credentials without changing any PTR
    ///
    /// The default accepts any credentials.
    async fn verify_credentials(&self) -> Result<(), crate::Error> {
        Ok(())
    }

    /// Get the provider name (for logging/debugging)
    fn provider_name(&self) -> &'static str;
}

/// Helper trait for constructing PTR providers from settings
pub trait PtrProviderFactory: Send + Sync {
    /// Create a PtrProvider instance from settings
    fn create(
        &self,
        settings: &crate::config::PtrSettings,
    ) -> Result<std::sync::Arc<dyn PtrProvider>, crate::Error>;
}

impl<F> PtrProviderFactory for F
where
    F: Fn(&crate::config::PtrSettings) -> Result<std::sync::Arc<dyn PtrProvider>, crate::Error>
        + Send
        + Sync,
{
    fn create(
        &self,
        settings: &crate::config::PtrSettings,
    ) -> Result<std::sync::Arc<dyn PtrProvider>, crate::Error> {
        self(settings)
    }
}
