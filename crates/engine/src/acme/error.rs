//! ACME error types

use std::io;
use thiserror::Error;

use super::dns::DnsProviderError;
use crate::cluster::CoordinationError;

/// Errors that can occur while driving a certificate's lifecycle
///
/// Every variant raised inside a single domain's `advance()` is contained
/// there; none of them stop the reconciliation loop.
#[derive(Debug, Error)]
pub enum AcmeError {
    /// Transport or protocol failure talking to the ACME server.
    /// No state change; the next tick retries.
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// DNS record creation or deletion failed
    #[error("Challenge provisioning failed for domain '{domain}': {source}")]
    ChallengeProvisioning {
        domain: String,
        #[source]
        source: DnsProviderError,
    },

    /// The ACME server reported the challenge or order as invalid
    #[error("Verification failed for domain '{domain}': {message}")]
    VerificationFailed { domain: String, message: String },

    /// DNS record never became visible within the configured attempts
    #[error("DNS challenge for domain '{domain}' not visible after {attempts} attempts")]
    AttemptLimitExceeded { domain: String, attempts: u32 },

    /// Invalid per-domain settings, rejected at reload time
    #[error("Invalid certificate configuration: {0}")]
    Configuration(String),

    /// Coordination service session unavailable
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(#[from] CoordinationError),

    /// No HTTP-01 challenge offered for domain
    #[error("No HTTP-01 challenge available for domain '{0}'")]
    NoHttp01Challenge(String),

    /// No DNS-01 challenge offered for domain
    #[error("No DNS-01 challenge available for domain '{0}'")]
    NoDns01Challenge(String),

    /// Wildcard domain but no DNS provider configured
    #[error("Wildcard domain '{0}' requires a DNS provider for DNS-01 challenges")]
    NoDnsProvider(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Domain key pair could not be generated, parsed, or used for signing
    #[error("Key pair error: {0}")]
    KeyPair(String),

    /// Certificate chain could not be parsed
    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),

    /// Domain has no stored certificate record
    #[error("No certificate record for domain '{0}'")]
    UnknownDomain(String),
}

impl AcmeError {
    /// Whether the error is a plain "no progress this tick" condition
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AcmeError::Protocol(_)
                | AcmeError::ChallengeProvisioning { .. }
                | AcmeError::CoordinationUnavailable(_)
                | AcmeError::Storage(_)
        )
    }
}

/// Errors specific to certificate storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize data
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid storage structure
    #[error("Invalid storage structure: {0}")]
    InvalidStructure(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}

impl From<rcgen::Error> for AcmeError {
    fn from(e: rcgen::Error) -> Self {
        AcmeError::KeyPair(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AcmeError::Protocol("connection reset".to_string()).is_transient());
        assert!(!AcmeError::VerificationFailed {
            domain: "example.com".to_string(),
            message: "invalid".to_string(),
        }
        .is_transient());
        assert!(!AcmeError::AttemptLimitExceeded {
            domain: "*.example.com".to_string(),
            attempts: 3,
        }
        .is_transient());
    }

    #[test]
    fn test_error_display_names_domain() {
        let err = AcmeError::AttemptLimitExceeded {
            domain: "*.example.com".to_string(),
            attempts: 3,
        };
        assert!(err.to_string().contains("*.example.com"));
        assert!(err.to_string().contains('3'));
    }
}
