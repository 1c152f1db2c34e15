//! Plugin-based provider registry
//!
//! The registry maps provider names to factories, so the daemon constructs
//! backends from configuration instead of hardcoded if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use maildns_core::registry::ProviderRegistry;
//!
//! let mut registry = ProviderRegistry::new();
//! maildns_provider_cloudflare::register(&mut registry);
//! maildns_ptr_hetzner::register(&mut registry);
//!
//! let provider = registry.create_provider(&settings)?;
//! let ptr = registry.create_ptr_provider("hetzner", &ptr_settings)?;
//! ```
//!
//! ## Registration
//!
//! Implementations register themselves during startup:
//!
//! ```rust,ignore
//! // In maildns-provider-cloudflare
//! pub fn register(registry: &mut ProviderRegistry) {
//!     registry.register_provider("cloudflare", Box::new(create_provider));
//! }
//! ```
//!
//! Names are matched case-insensitively.

use crate::config::{ProviderSettings, PtrSettings};
use crate::error::{Error, Result};
use crate::traits::{DnsProvider, DnsProviderFactory, PtrProvider, PtrProviderFactory};
use std::collections::HashMap;
use std::sync::Arc;

/// Startup-time table of DNS and PTR provider factories
#[derive(Default)]
pub struct ProviderRegistry {
    /// Registered DNS provider factories
    providers: HashMap<String, Box<dyn DnsProviderFactory>>,

    /// Registered PTR provider factories
    ptr_providers: HashMap<String, Box<dyn PtrProviderFactory>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a DNS provider factory
    ///
    /// # Parameters
    ///
    /// - `name`: Provider type name (e.g., "cloudflare")
    /// - `factory`: Factory or constructor closure
    ///
    /// A second registration under the same name replaces the first.
    pub fn register_provider(&mut self, name: impl AsRef<str>, factory: Box<dyn DnsProviderFactory>) {
        self.providers.insert(key(name.as_ref()), factory);
    }

    /// Register a PTR provider factory
    ///
    /// # Parameters
    ///
    /// - `name`: Provider name (e.g., "hetzner", "hetzner-robot")
    /// - `factory`: Factory or constructor closure
    pub fn register_ptr_provider(
        &mut self,
        name: impl AsRef<str>,
        factory: Box<dyn PtrProviderFactory>,
    ) {
        self.ptr_providers.insert(key(name.as_ref()), factory);
    }

    /// Create a DNS provider from settings
    ///
    /// # Returns
    ///
    /// - `Ok(Arc<dyn DnsProvider>)`: Created provider instance
    /// - `Err(Error::Config)`: Invalid settings or unknown provider type
    /// - `Err(Error)`: Factory failure
    pub fn create_provider(&self, settings: &ProviderSettings) -> Result<Arc<dyn DnsProvider>> {
        settings.validate()?;
        let provider_type = settings.type_name();

        let factory = self.providers.get(&key(provider_type)).ok_or_else(|| {
            Error::config(format!(
                "Unknown DNS provider: {} (available: {})",
                provider_type,
                self.list_providers().join(", ")
            ))
        })?;

        factory.create(settings)
    }

    /// Create a PTR provider registered as `name`
    pub fn create_ptr_provider(
        &self,
        name: &str,
        settings: &PtrSettings,
    ) -> Result<Arc<dyn PtrProvider>> {
        settings.validate()?;

        let factory = self.ptr_providers.get(&key(name)).ok_or_else(|| {
            Error::config(format!(
                "Unknown PTR provider: {} (available: {})",
                name,
                self.list_ptr_providers().join(", ")
            ))
        })?;

        factory.create(settings)
    }

    /// List registered DNS provider names, sorted
    pub fn list_providers(&self) -> Vec<String> {
        sorted(self.providers.keys())
    }

    /// List registered PTR provider names, sorted
    pub fn list_ptr_providers(&self) -> Vec<String> {
        sorted(self.ptr_providers.keys())
    }

    /// Check if a DNS provider is registered
    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(&key(name))
    }

    /// Check if a PTR provider is registered
    pub fn has_ptr_provider(&self, name: &str) -> bool {
        self.ptr_providers.contains_key(&key(name))
    }
}

fn key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn sorted<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut names: Vec<String> = names.cloned().collect();
    names.sort();
    names
}
