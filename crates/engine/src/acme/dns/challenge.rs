//! DNS-01 challenge provisioning
//!
//! Publishes, polls and withdraws the `_acme-challenge` TXT record. Each
//! operation is a single step; the state machine decides when to call it.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::provider::{challenge_record_fqdn, DnsProvider, RecordVisibility};
use crate::acme::error::AcmeError;

/// Compute the DNS-01 TXT value for a key authorization
///
/// The value is the base64url-encoded SHA256 digest of the key authorization.
pub fn compute_challenge_value(key_authorization: &str) -> String {
    let digest = Sha256::digest(key_authorization.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// DNS-01 challenge provisioner
#[derive(Debug, Clone)]
pub struct Dns01Provisioner {
    provider: Arc<dyn DnsProvider>,
    visibility: Arc<dyn RecordVisibility>,
}

impl Dns01Provisioner {
    pub fn new(provider: Arc<dyn DnsProvider>, visibility: Arc<dyn RecordVisibility>) -> Self {
        Self {
            provider,
            visibility,
        }
    }

    /// Publish the challenge record
    pub async fn create_record(&self, domain: &str, digest: &str) -> Result<(), AcmeError> {
        debug!(
            domain = %domain,
            record = %challenge_record_fqdn(domain),
            provider = %self.provider.name(),
            "Creating DNS-01 challenge record"
        );

        self.provider
            .create_txt_record(domain, digest)
            .await
            .map_err(|source| AcmeError::ChallengeProvisioning {
                domain: domain.to_string(),
                source,
            })
    }

    /// Whether the published record resolves yet
    ///
    /// Lookup failures count as "not visible".
    pub async fn is_record_visible(&self, domain: &str, digest: &str) -> bool {
        match self.visibility.is_visible(domain, digest).await {
            Ok(visible) => visible,
            Err(e) => {
                warn!(domain = %domain, error = %e, "DNS-01 visibility check failed");
                false
            }
        }
    }

    /// Withdraw the challenge record
    ///
    /// Best effort: failures are logged and never propagated.
    pub async fn delete_record(&self, domain: &str, digest: &str) {
        match self.provider.delete_txt_record(domain, digest).await {
            Ok(()) => {
                info!(domain = %domain, "DNS-01 challenge record cleaned up");
            }
            Err(e) => {
                warn!(
                    domain = %domain,
                    record = %challenge_record_fqdn(domain),
                    error = %e,
                    "Failed to cleanup DNS-01 challenge record"
                );
            }
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::dns::provider::{DnsProviderError, DnsResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    struct MockDns {
        records: Mutex<HashMap<String, String>>,
        fail: bool,
    }

    #[async_trait]
    impl DnsProvider for MockDns {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn create_txt_record(&self, domain: &str, digest: &str) -> DnsResult<()> {
            if self.fail {
                return Err(DnsProviderError::RecordCreation {
                    record_name: challenge_record_fqdn(domain),
                    message: "Mock failure".to_string(),
                });
            }
            self.records
                .lock()
                .insert(challenge_record_fqdn(domain), digest.to_string());
            Ok(())
        }

        async fn delete_txt_record(&self, domain: &str, _digest: &str) -> DnsResult<()> {
            if self.fail {
                return Err(DnsProviderError::RecordDeletion {
                    record_name: challenge_record_fqdn(domain),
                    message: "Mock failure".to_string(),
                });
            }
            self.records.lock().remove(&challenge_record_fqdn(domain));
            Ok(())
        }
    }

    #[async_trait]
    impl RecordVisibility for MockDns {
        async fn is_visible(&self, domain: &str, digest: &str) -> DnsResult<bool> {
            if self.fail {
                return Err(DnsProviderError::Lookup {
                    record_name: challenge_record_fqdn(domain),
                    message: "SERVFAIL".to_string(),
                });
            }
            Ok(self
                .records
                .lock()
                .get(&challenge_record_fqdn(domain))
                .is_some_and(|v| v == digest))
        }
    }

    fn provisioner(dns: Arc<MockDns>) -> Dns01Provisioner {
        Dns01Provisioner::new(dns.clone(), dns)
    }

    #[test]
    fn test_compute_challenge_value() {
        let value = compute_challenge_value("token.thumbprint");

        // 32-byte digest, unpadded base64url
        assert_eq!(value.len(), 43);
        assert!(!value.contains('+'));
        assert!(!value.contains('/'));
        assert!(!value.contains('='));
        assert_eq!(value, compute_challenge_value("token.thumbprint"));
        assert_ne!(value, compute_challenge_value("token.other"));
    }

    #[tokio::test]
    async fn test_create_check_delete() {
        let dns = Arc::new(MockDns::default());
        let provisioner = provisioner(dns.clone());

        assert!(!provisioner.is_record_visible("*.example.com", "digest").await);

        provisioner
            .create_record("*.example.com", "digest")
            .await
            .unwrap();
        assert!(provisioner.is_record_visible("*.example.com", "digest").await);
        assert!(!provisioner.is_record_visible("*.example.com", "other").await);

        provisioner.delete_record("*.example.com", "digest").await;
        assert!(dns.records.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_contained() {
        let dns = Arc::new(MockDns {
            fail: true,
            ..Default::default()
        });
        let provisioner = provisioner(dns);

        let err = provisioner
            .create_record("*.example.com", "digest")
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::ChallengeProvisioning { .. }));

        // Lookup errors read as not visible, delete errors are swallowed
        assert!(!provisioner.is_record_visible("*.example.com", "digest").await);
        provisioner.delete_record("*.example.com", "digest").await;
    }
}
