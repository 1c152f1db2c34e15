// # maildns-core
//
// Core library for the mail relay DNS reconciler.
//
// ## Architecture Overview
//
// Keeps the DNS footprint of a mail relay (A, MX, SPF, DKIM, DMARC and an
// optional PTR) converged with the relay's current network identity:
// - **DnsProvider**: Trait for primitive record operations on a DNS backend
// - **OwnershipRegistry**: Marker-record layer that only touches owned records
// - **DesiredState**: Pure builder for the records the relay should publish
// - **DnsManager**: Reconciler for detect, apply, check, cleanup and status
// - **DriftWatcher**: Long-running loop that reconciles on drift
// - **StateStore**: Hand-off between the initializer and the watcher
// - **ProviderRegistry**: Startup table of provider factories
//
// ## Design Principles
//
// 1. **Ownership first**: Records without this instance's marker are never modified
// 2. **Idempotency**: Re-applying an unchanged desired state writes nothing
// 3. **Plugin-Based**: Providers are registered by name, no hard-coded if-else
// 4. **Library-First**: All core functionality can be used as a library

pub mod config;
pub mod desired;
pub mod error;
pub mod manager;
pub mod ownership;
pub mod record;
pub mod registry;
pub mod state;
pub mod traits;
pub mod watcher;

// Re-export core types for convenience
pub use config::{
    DomainConfig, MailConfig, ProviderConfig, ProviderSettings, PtrConfig, PtrSettings,
    WatchConfig,
};
pub use desired::DesiredState;
pub use error::{Error, Result};
pub use manager::{DnsManager, StatusReport};
pub use ownership::OwnershipRegistry;
pub use record::{DnsRecord, OwnershipMarker, RecordType};
pub use registry::ProviderRegistry;
pub use state::{FileStateStore, MemoryStateStore};
pub use traits::{ClusterInfo, DetectedState, DnsProvider, IpDetector, PtrProvider, StateStore};
pub use watcher::{DriftWatcher, PollOutcome, WatchEvent, WatchState};
