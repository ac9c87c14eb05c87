//! DNS provider trait for DNS-01 challenges

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

/// Result type for DNS operations
pub type DnsResult<T> = Result<T, DnsProviderError>;

/// Errors that can occur during DNS provider operations
#[derive(Debug, Error)]
pub enum DnsProviderError {
    /// Authentication failed with the DNS provider
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Zone not found for the domain
    #[error("Zone not found for domain '{domain}'")]
    ZoneNotFound { domain: String },

    /// Record creation failed
    #[error("Failed to create TXT record '{record_name}': {message}")]
    RecordCreation { record_name: String, message: String },

    /// Record deletion failed
    #[error("Failed to delete TXT record '{record_name}': {message}")]
    RecordDeletion { record_name: String, message: String },

    /// API request failed
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Resolver lookup failed for a reason other than a missing record
    #[error("DNS lookup failed for '{record_name}': {message}")]
    Lookup { record_name: String, message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

/// A DNS service able to publish and withdraw challenge TXT records
///
/// Both operations take the configured domain (wildcard marker included) and
/// the challenge digest; the record name is derived with
/// [`challenge_record_fqdn`].
#[async_trait]
pub trait DnsProvider: Send + Sync + Debug {
    /// Provider name for logs (e.g. "route53")
    fn name(&self) -> &'static str;

    /// Create or replace the challenge TXT record
    async fn create_txt_record(&self, domain: &str, digest: &str) -> DnsResult<()>;

    /// Remove the challenge TXT record
    ///
    /// Must not fail when the record is already gone.
    async fn delete_txt_record(&self, domain: &str, digest: &str) -> DnsResult<()>;
}

/// Answers whether a published challenge record can be resolved yet
#[async_trait]
pub trait RecordVisibility: Send + Sync + Debug {
    async fn is_visible(&self, domain: &str, digest: &str) -> DnsResult<bool>;
}

/// ACME challenge record name prefix
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// TTL for challenge records
pub const CHALLENGE_TTL: u32 = 60;

/// Strip the wildcard marker from a domain
///
/// `*.example.com` and `example.com` share the same challenge record.
pub fn normalize_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// Build the full ACME challenge record name
///
/// For `example.com` and `*.example.com`, returns `_acme-challenge.example.com`
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("{}.{}", ACME_CHALLENGE_RECORD, normalize_domain(domain))
}
