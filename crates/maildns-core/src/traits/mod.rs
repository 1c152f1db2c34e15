//! Core traits for the mail relay DNS reconciler
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`DnsProvider`]: Primitive record operations on a DNS backend
//! - [`PtrProvider`]: Reverse DNS for the relay's address
//! - [`IpDetector`]: The relay's incoming and outbound addresses
//! - [`ClusterInfo`]: DKIM keys and service exposure from the cluster
//! - [`StateStore`]: Hand-off of detected state between processes

pub mod cluster;
pub mod dns_provider;
pub mod ip_detector;
pub mod ptr_provider;
pub mod state_store;

pub use cluster::{ClusterInfo, ServiceType};
pub use dns_provider::{DnsProvider, DnsProviderFactory};
pub use ip_detector::IpDetector;
pub use ptr_provider::{PtrProvider, PtrProviderFactory};
pub use state_store::{DetectedState, StateDocument, StateStore};
