//! HTTP-01 ACME challenge responses
//!
//! The state machine registers every HTTP-01 challenge it triggers with the
//! local [`ChallengeManager`]. The ACME server may send its validation
//! request to any node of the cluster, so [`Http01Responder`] falls back to
//! the pending challenge persisted in the store for the requested host.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::state::PendingChallenge;
use super::storage::CertificateStore;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Clone)]
struct RegisteredChallenge {
    domain: String,
    key_authorization: String,
}

/// Local cache of pending HTTP-01 challenges
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    /// Map of challenge token -> domain and key authorization
    challenges: Arc<DashMap<String, RegisteredChallenge>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending challenge for a domain
    ///
    /// Any earlier challenge of the same domain is replaced.
    pub fn add_challenge(&self, domain: &str, token: &str, key_authorization: &str) {
        self.remove_domain(domain);
        debug!(domain = %domain, token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges.insert(
            token.to_string(),
            RegisteredChallenge {
                domain: domain.to_string(),
                key_authorization: key_authorization.to_string(),
            },
        );
    }

    /// Remove a completed or abandoned challenge
    pub fn remove_challenge(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }

    /// Remove every challenge registered for a domain
    pub fn remove_domain(&self, domain: &str) {
        self.challenges.retain(|_, c| c.domain != domain);
    }

    /// Key authorization for a token, if registered locally
    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self
            .challenges
            .get(token)
            .map(|c| c.key_authorization.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    /// Token of a challenge request path
    ///
    /// Returns `Some(token)` if the path matches the challenge prefix.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }

    /// Get the number of pending challenges
    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    pub fn clear(&self) {
        let count = self.challenges.len();
        self.challenges.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared all pending ACME challenges");
        }
    }
}

/// Answers inbound HTTP-01 validation requests
///
/// Exposed to the proxy layer, which calls [`Http01Responder::response_for`]
/// for every request under [`ACME_CHALLENGE_PREFIX`].
#[derive(Debug, Clone)]
pub struct Http01Responder {
    challenges: ChallengeManager,
    store: Arc<dyn CertificateStore>,
}

impl Http01Responder {
    pub fn new(challenges: ChallengeManager, store: Arc<dyn CertificateStore>) -> Self {
        Self { challenges, store }
    }

    /// Response body for a validation request, `None` if it is not one
    ///
    /// `host` may carry a port, which is ignored. Host names compare
    /// case-insensitively, as stored domains are lowercase.
    pub fn response_for(&self, host: &str, path: &str) -> Option<String> {
        let token = ChallengeManager::extract_token(path)?;

        if let Some(response) = self.challenges.get_response(token) {
            return Some(response);
        }

        let domain = host
            .rsplit_once(':')
            .map_or(host, |(name, _)| name)
            .trim_end_matches('.')
            .to_ascii_lowercase();
        let data = match self.store.load_certificate_for_domain(&domain) {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                warn!(domain = %domain, error = %e, "Failed to load certificate record for challenge");
                return None;
            }
        };

        match data.pending_challenge() {
            Ok(Some(PendingChallenge::Http01 {
                token: pending,
                key_authorization,
                ..
            })) if pending == token => {
                debug!(domain = %domain, token = %token, "Answering ACME challenge from store");
                Some(key_authorization)
            }
            _ => None,
        }
    }
}
