//! ACME protocol driver
//!
//! [`AcmeDriver`] is the narrow set of single-step ACME operations the state
//! machine needs. Nothing here waits or polls: every call does one round of
//! requests and reports what the server said. In-flight orders are addressed
//! by their URL, so they survive restarts and can be continued by any node.
//!
//! [`AcmeClient`] implements the driver on top of `instant-acme`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeStatus, ChallengeType, Identifier,
    LetsEncrypt, NewAccount, NewOrder, Order, OrderStatus,
};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use certfleet_config::AcmeConfig;

use super::dns::compute_challenge_value;
use super::error::AcmeError;
use super::state::{ChallengeKind, PendingChallenge};
use super::storage::{CertificateStore, DomainKeyPair};

/// Status of a challenge or order as reported by the ACME server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeStatus {
    Pending,
    Processing,
    /// Order only: all authorizations valid, ready for the CSR
    Ready,
    Valid,
    Invalid,
}

/// Single-step ACME operations used by the certificate state machine
///
/// Every method fails with [`AcmeError::Protocol`] on transport or protocol
/// errors; callers treat that as "no progress this time".
#[async_trait]
pub trait AcmeDriver: Send + Sync {
    /// Bind to the ACME account, creating it on first use
    async fn login(&self) -> Result<(), AcmeError>;

    /// Create an order for one domain and return its URL
    async fn create_order(&self, domain: &str) -> Result<String, AcmeError>;

    /// Challenge of the requested kind for the order's authorization
    ///
    /// Returns `None` when the authorization is already valid and no
    /// challenge has to be completed.
    async fn challenge_for_order(
        &self,
        order_url: &str,
        kind: ChallengeKind,
    ) -> Result<Option<PendingChallenge>, AcmeError>;

    /// Tell the server the challenge response is in place
    async fn trigger_challenge(
        &self,
        order_url: &str,
        challenge: &PendingChallenge,
    ) -> Result<(), AcmeError>;

    /// Current status of a triggered challenge
    async fn check_challenge(
        &self,
        order_url: &str,
        challenge: &PendingChallenge,
    ) -> Result<AcmeStatus, AcmeError>;

    /// Submit a CSR for the domain signed with its key pair
    async fn order_certificate(
        &self,
        order_url: &str,
        domain: &str,
        key_pair: &DomainKeyPair,
    ) -> Result<(), AcmeError>;

    /// Current status of the order
    async fn check_order(&self, order_url: &str) -> Result<AcmeStatus, AcmeError>;

    /// PEM chain of a valid order
    async fn fetch_certificate(&self, order_url: &str) -> Result<String, AcmeError>;
}

/// Resolve the directory URL for a configuration
///
/// An explicit `directory-url` wins; otherwise Let's Encrypt staging or
/// production.
pub fn directory_url(config: &AcmeConfig) -> String {
    match &config.directory_url {
        Some(url) => url.clone(),
        None if config.staging => LetsEncrypt::Staging.url().to_string(),
        None => LetsEncrypt::Production.url().to_string(),
    }
}

fn challenge_type(kind: ChallengeKind) -> ChallengeType {
    match kind {
        ChallengeKind::Http01 => ChallengeType::Http01,
        ChallengeKind::Dns01 => ChallengeType::Dns01,
    }
}

fn challenge_status(status: &ChallengeStatus) -> AcmeStatus {
    match status {
        ChallengeStatus::Pending => AcmeStatus::Pending,
        ChallengeStatus::Processing => AcmeStatus::Processing,
        ChallengeStatus::Valid => AcmeStatus::Valid,
        ChallengeStatus::Invalid => AcmeStatus::Invalid,
        #[allow(unreachable_patterns)]
        _ => AcmeStatus::Pending,
    }
}

fn order_status(status: &OrderStatus) -> AcmeStatus {
    match status {
        OrderStatus::Pending => AcmeStatus::Pending,
        OrderStatus::Ready => AcmeStatus::Ready,
        OrderStatus::Processing => AcmeStatus::Processing,
        OrderStatus::Valid => AcmeStatus::Valid,
        OrderStatus::Invalid => AcmeStatus::Invalid,
        #[allow(unreachable_patterns)]
        _ => AcmeStatus::Pending,
    }
}

/// ACME client backed by `instant-acme`
///
/// Account credentials are persisted in the certificate store, so every node
/// of a cluster uses the same account.
pub struct AcmeClient {
    directory_url: String,
    email: Option<String>,
    store: Arc<dyn CertificateStore>,
    account: Mutex<Option<Account>>,
}

impl AcmeClient {
    pub fn new(config: &AcmeConfig, store: Arc<dyn CertificateStore>) -> Self {
        Self {
            directory_url: directory_url(config),
            email: config.email.clone(),
            store,
            account: Mutex::new(None),
        }
    }

    pub fn directory(&self) -> &str {
        &self.directory_url
    }

    /// Logged-in account, restoring or creating it on first use
    async fn account(&self) -> Result<Account, AcmeError> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }

        let account = if let Some(creds_json) = self.store.load_account_credentials()? {
            debug!("Restoring ACME account from stored credentials");
            let credentials: AccountCredentials = serde_json::from_str(&creds_json)
                .map_err(|e| AcmeError::Protocol(format!("Failed to deserialize credentials: {}", e)))?;
            Account::from_credentials(credentials).await?
        } else {
            info!(
                email = ?self.email,
                directory = %self.directory_url,
                "Creating new ACME account"
            );

            let contact = self.email.as_ref().map(|email| format!("mailto:{}", email));
            let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
            let (account, credentials) = Account::create(
                &NewAccount {
                    contact: &contact_refs,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                &self.directory_url,
                None,
            )
            .await?;

            let creds_json = serde_json::to_string_pretty(&credentials)
                .map_err(|e| AcmeError::Protocol(format!("Failed to serialize credentials: {}", e)))?;
            self.store.save_account_credentials(&creds_json)?;
            info!("ACME account created");
            account
        };

        *guard = Some(account.clone());
        Ok(account)
    }

    async fn order(&self, order_url: &str) -> Result<Order, AcmeError> {
        let account = self.account().await?;
        Ok(account.order(order_url.to_string()).await?)
    }
}

impl fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.directory_url)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AcmeDriver for AcmeClient {
    async fn login(&self) -> Result<(), AcmeError> {
        self.account().await.map(|_| ())
    }

    async fn create_order(&self, domain: &str) -> Result<String, AcmeError> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        debug!(domain = %domain, order = %order.url(), "Created ACME order");
        Ok(order.url().to_string())
    }

    async fn challenge_for_order(
        &self,
        order_url: &str,
        kind: ChallengeKind,
    ) -> Result<Option<PendingChallenge>, AcmeError> {
        let mut order = self.order(order_url).await?;
        let authorizations = order.authorizations().await?;

        let Some(authz) = authorizations.first() else {
            return Err(AcmeError::Protocol(format!(
                "Order {} has no authorizations",
                order_url
            )));
        };
        let domain = match &authz.identifier {
            Identifier::Dns(domain) => domain.clone(),
            #[allow(unreachable_patterns)]
            other => {
                return Err(AcmeError::Protocol(format!(
                    "Unsupported identifier {:?} in order {}",
                    other, order_url
                )))
            }
        };

        if authz.status == AuthorizationStatus::Valid {
            debug!(domain = %domain, "Authorization already valid");
            return Ok(None);
        }

        let wanted = challenge_type(kind);
        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == wanted)
            .ok_or_else(|| match kind {
                ChallengeKind::Http01 => AcmeError::NoHttp01Challenge(domain.clone()),
                ChallengeKind::Dns01 => AcmeError::NoDns01Challenge(domain.clone()),
            })?;

        if challenge.status == ChallengeStatus::Valid {
            debug!(domain = %domain, "Challenge already valid");
            return Ok(None);
        }

        let key_authorization = order.key_authorization(challenge);
        let pending = match kind {
            ChallengeKind::Http01 => PendingChallenge::Http01 {
                url: challenge.url.clone(),
                token: challenge.token.clone(),
                key_authorization: key_authorization.as_str().to_string(),
            },
            ChallengeKind::Dns01 => PendingChallenge::Dns01 {
                url: challenge.url.clone(),
                digest: compute_challenge_value(key_authorization.as_str()),
            },
        };

        trace!(domain = %domain, challenge = %challenge.url, "Selected challenge");
        Ok(Some(pending))
    }

    async fn trigger_challenge(
        &self,
        order_url: &str,
        challenge: &PendingChallenge,
    ) -> Result<(), AcmeError> {
        let mut order = self.order(order_url).await?;
        order.set_challenge_ready(challenge.url()).await?;
        debug!(challenge = %challenge.url(), "Challenge triggered");
        Ok(())
    }

    async fn check_challenge(
        &self,
        order_url: &str,
        challenge: &PendingChallenge,
    ) -> Result<AcmeStatus, AcmeError> {
        let mut order = self.order(order_url).await?;
        let authorizations = order.authorizations().await?;

        for authz in &authorizations {
            if let Some(found) = authz.challenges.iter().find(|c| c.url == challenge.url()) {
                return Ok(challenge_status(&found.status));
            }
            if authz.status == AuthorizationStatus::Valid {
                return Ok(AcmeStatus::Valid);
            }
        }

        Err(AcmeError::Protocol(format!(
            "Challenge {} not found in order {}",
            challenge.url(),
            order_url
        )))
    }

    async fn order_certificate(
        &self,
        order_url: &str,
        domain: &str,
        key_pair: &DomainKeyPair,
    ) -> Result<(), AcmeError> {
        let mut order = self.order(order_url).await?;

        let signing_key = key_pair.signing_key()?;
        let params = rcgen::CertificateParams::new(vec![domain.to_string()])?;
        let csr = params.serialize_request(&signing_key)?;

        order.finalize(csr.der()).await?;
        debug!(domain = %domain, "Certificate signing request submitted");
        Ok(())
    }

    async fn check_order(&self, order_url: &str) -> Result<AcmeStatus, AcmeError> {
        let mut order = self.order(order_url).await?;
        let state = order.refresh().await?;
        Ok(order_status(&state.status))
    }

    async fn fetch_certificate(&self, order_url: &str) -> Result<String, AcmeError> {
        let mut order = self.order(order_url).await?;
        order
            .certificate()
            .await?
            .ok_or_else(|| AcmeError::Protocol(format!("Order {} has no certificate yet", order_url)))
    }
}
