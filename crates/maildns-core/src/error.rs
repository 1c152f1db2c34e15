//! Error types for the mail relay DNS reconciler
//!
//! Provider, cluster and detector implementations report failures through
//! [`Error`]. The ownership layer and the reconciler turn these into
//! boolean outcomes and log lines; they never propagate past the
//! reconciliation boundary.

use thiserror::Error;

/// Result type alias for reconciler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the mail relay DNS reconciler
#[derive(Error, Debug)]
pub enum Error {
    /// DNS provider-related errors
    #[error("DNS provider error: {0}")]
    DnsProvider(String),

    /// Reverse DNS (PTR) provider errors
    #[error("PTR provider error: {0}")]
    PtrProvider(String),

    /// Cluster API errors (secrets, services, nodes)
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// IP detection errors
    #[error("IP detection error: {0}")]
    IpDetection(String),

    /// State store-related errors
    #[error("State store error: {0}")]
    StateStore(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem and socket errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors (from provider APIs)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rate limiting errors
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Zone, record or resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Provider-specific error
    #[error("Provider error ({provider}): {message}")]
    Provider {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a DNS provider error
    pub fn dns_provider(msg: impl Into<String>) -> Self {
        Self::DnsProvider(msg.into())
    }

    /// Create a PTR provider error
    pub fn ptr_provider(msg: impl Into<String>) -> Self {
        Self::PtrProvider(msg.into())
    }

    /// Create a cluster error
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create an IP detection error
    pub fn ip_detection(msg: impl Into<String>) -> Self {
        Self::IpDetection(msg.into())
    }

    /// Create a state store error
    pub fn state_store(msg: impl Into<String>) -> Self {
        Self::StateStore(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a provider-specific error
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is likely to clear up on its own
    ///
    /// Rate limits and HTTP transport failures are transient; everything
    /// else needs a configuration or data change before a retry helps.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Http(_) | Self::Io(_))
    }
}
