//! Per-domain certificate lifecycle
//!
//! [`CertificateStateMachine::advance`] performs at most one transition for a
//! domain and persists the result:
//!
//! ```text
//! WAITING -> [DNS_CHALLENGE_WAIT] -> VERIFYING -> VERIFIED -> ORDERING -> AVAILABLE
//!    ^                                                                      |
//!    +------------------ EXPIRED / REQUEST_FAILED <-------------------------+
//! ```
//!
//! The certificate store is the source of truth: every call reloads the
//! record, so any node of a cluster can continue an order started elsewhere.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use tracing::{debug, info, trace, warn};

use certfleet_config::{CertificateConfig, CertificatesConfig, ConfigError};

use super::challenge::ChallengeManager;
use super::client::{AcmeDriver, AcmeStatus};
use super::dns::Dns01Provisioner;
use super::error::AcmeError;
use super::state::{CertificateData, ChallengeKind, DynamicCertificateState, PendingChallenge};
use super::storage::{CertificateStore, DomainKeyPair};

use DynamicCertificateState as State;

/// Certificate material of an available domain
#[derive(Clone, PartialEq, Eq)]
pub struct DomainCertificate {
    pub domain: String,
    pub chain_pem: String,
    pub key_pem: String,
}

impl fmt::Debug for DomainCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainCertificate")
            .field("domain", &self.domain)
            .field("chain_len", &self.chain_pem.len())
            .finish_non_exhaustive()
    }
}

/// Drives every configured domain through the ACME lifecycle
pub struct CertificateStateMachine {
    driver: Arc<dyn AcmeDriver>,
    store: Arc<dyn CertificateStore>,
    dns: Option<Dns01Provisioner>,
    challenges: ChallengeManager,
    certificates: ArcSwap<CertificatesConfig>,
}

impl CertificateStateMachine {
    /// Create a state machine with an empty certificate table
    ///
    /// `dns` is required for wildcard domains; call
    /// [`reload_configuration`](Self::reload_configuration) before advancing.
    pub fn new(
        driver: Arc<dyn AcmeDriver>,
        store: Arc<dyn CertificateStore>,
        dns: Option<Dns01Provisioner>,
        challenges: ChallengeManager,
    ) -> Self {
        Self {
            driver,
            store,
            dns,
            challenges,
            certificates: ArcSwap::from_pointee(CertificatesConfig::default()),
        }
    }

    /// Validate and swap in a new certificate table
    ///
    /// An invalid table is rejected as a whole and the previous one stays in
    /// effect. Records of new domains are created lazily on first use.
    pub fn reload_configuration(&self, config: &CertificatesConfig) -> Result<(), AcmeError> {
        config
            .validate_table(self.dns.is_some())
            .map_err(|e| match e {
                ConfigError::Invalid(problems) => AcmeError::Configuration(problems.join("; ")),
                other => AcmeError::Configuration(other.to_string()),
            })?;

        let previous = self.certificates.swap(Arc::new(config.clone()));
        for removed in previous
            .certificates
            .iter()
            .filter(|c| config.get(&c.hostname).is_none())
        {
            debug!(domain = %removed.hostname, "Certificate removed from configuration");
            self.challenges.remove_domain(&removed.hostname);
        }

        info!(
            certificates = config.certificates.len(),
            period_secs = config.period_secs,
            "Certificate configuration loaded"
        );
        Ok(())
    }

    /// Currently configured domains, in configuration order
    pub fn domains(&self) -> Vec<String> {
        self.certificates
            .load()
            .certificates
            .iter()
            .map(|c| c.hostname.clone())
            .collect()
    }

    /// Snapshot of the current certificate table
    pub fn configuration(&self) -> Arc<CertificatesConfig> {
        self.certificates.load_full()
    }

    /// Bind the ACME account
    pub async fn login(&self) -> Result<(), AcmeError> {
        self.driver.login().await
    }

    pub fn state_of_certificate(&self, domain: &str) -> Result<DynamicCertificateState, AcmeError> {
        Ok(self.certificate_data(domain)?.state)
    }

    /// Operator override of a domain's state
    ///
    /// Persisted immediately. Forcing `EXPIRED` on an ACME domain renews it on
    /// the next tick; manual domains only record the new state.
    pub fn set_state_of_certificate(
        &self,
        domain: &str,
        state: DynamicCertificateState,
    ) -> Result<(), AcmeError> {
        let mut data = self.certificate_data(domain)?;
        info!(domain = %domain, from = %data.state, to = %state, "Certificate state overridden");
        data.state = state;
        self.store.save_certificate(&data)?;
        Ok(())
    }

    /// Stored record of a configured domain, or the record it would start with
    pub fn certificate_data(&self, domain: &str) -> Result<CertificateData, AcmeError> {
        let entry = self.entry(domain)?;
        self.load_record(&entry)
    }

    /// Chain and key of a domain, `None` unless it is available
    pub fn certificate_for_domain(&self, domain: &str) -> Result<Option<DomainCertificate>, AcmeError> {
        let data = self.certificate_data(domain)?;
        if data.state != State::Available {
            return Ok(None);
        }
        let Some(chain_pem) = data.chain_pem()? else {
            return Ok(None);
        };
        let Some(key_pair) = self.store.load_key_pair_for_domain(domain)? else {
            return Ok(None);
        };

        Ok(Some(DomainCertificate {
            domain: data.domain,
            chain_pem,
            key_pem: key_pair.pem().to_string(),
        }))
    }

    /// Perform at most one transition for a domain
    ///
    /// Returns whether the state changed. The record is saved after every
    /// call except when it stays `AVAILABLE`. Protocol errors leave the stored
    /// record untouched, so the same step is retried on the next call.
    pub async fn advance(&self, domain: &str) -> Result<bool, AcmeError> {
        let entry = self.entry(domain)?;
        let mut data = self.load_record(&entry)?;

        if data.manual {
            trace!(domain = %domain, state = %data.state, "Skipping manual certificate");
            return Ok(false);
        }

        let previous = data.state;
        self.transition(&mut data).await?;

        if previous == State::Available && data.state == State::Available {
            trace!(domain = %domain, "Certificate is still valid");
            return Ok(false);
        }

        self.store.save_certificate(&data)?;

        let changed = previous != data.state;
        if changed {
            debug!(domain = %domain, from = %previous, to = %data.state, "Certificate state changed");
        }
        Ok(changed)
    }

    fn entry(&self, domain: &str) -> Result<CertificateConfig, AcmeError> {
        self.certificates
            .load()
            .get(domain)
            .cloned()
            .ok_or_else(|| AcmeError::UnknownDomain(domain.to_string()))
    }

    /// Stored record with the configured mode and renewal window applied
    fn load_record(&self, entry: &CertificateConfig) -> Result<CertificateData, AcmeError> {
        let mut data = match self.store.load_certificate_for_domain(&entry.hostname)? {
            Some(data) => data,
            None if entry.is_manual() => CertificateData::new(
                &entry.hostname,
                State::Available,
                String::new(),
                true,
                entry.days_before_renewal,
            ),
            None => CertificateData::waiting(&entry.hostname, entry.days_before_renewal),
        };
        data.manual = entry.is_manual();
        data.days_before_renewal = entry.days_before_renewal;
        Ok(data)
    }

    async fn transition(&self, data: &mut CertificateData) -> Result<(), AcmeError> {
        match data.state {
            State::Waiting => self.start_order(data).await,
            State::DnsChallengeWait => self.check_dns_record(data).await,
            State::Verifying => self.check_challenge(data).await,
            State::Verified => self.order_certificate(data).await,
            State::Ordering => self.check_order(data).await,
            State::Available => {
                if data.is_expired_or_due(Utc::now()) {
                    info!(
                        domain = %data.domain,
                        days_before_renewal = data.days_before_renewal,
                        "Certificate expired or due for renewal"
                    );
                    data.state = State::Expired;
                }
                Ok(())
            }
            State::Expired | State::RequestFailed => {
                data.clear_order();
                data.state = State::Waiting;
                Ok(())
            }
        }
    }

    /// WAITING: create the order and put its challenge in place
    async fn start_order(&self, data: &mut CertificateData) -> Result<(), AcmeError> {
        let kind = data.challenge_kind();
        if kind == ChallengeKind::Dns01 && self.dns.is_none() {
            return Err(AcmeError::NoDnsProvider(data.domain.clone()));
        }

        let order_url = self.driver.create_order(&data.domain).await?;
        debug!(domain = %data.domain, order = %order_url, "ACME order created");
        data.clear_order();
        data.order_location = order_url.clone();

        let Some(challenge) = self.driver.challenge_for_order(&order_url, kind).await? else {
            info!(domain = %data.domain, "Authorization already valid, no challenge needed");
            data.state = State::Verified;
            return Ok(());
        };

        match (&challenge, &self.dns) {
            (
                PendingChallenge::Http01 {
                    token,
                    key_authorization,
                    ..
                },
                _,
            ) => {
                self.challenges
                    .add_challenge(&data.domain, token, key_authorization);
                data.set_pending_challenge(Some(&challenge));
                self.driver.trigger_challenge(&order_url, &challenge).await?;
                data.state = State::Verifying;
            }
            (PendingChallenge::Dns01 { digest, .. }, Some(dns)) => {
                match dns.create_record(&data.domain, digest).await {
                    Ok(()) => {
                        data.set_pending_challenge(Some(&challenge));
                        data.state = State::DnsChallengeWait;
                    }
                    Err(e) => {
                        warn!(domain = %data.domain, error = %e, "DNS-01 record not created, retrying");
                        data.clear_order();
                    }
                }
            }
            (PendingChallenge::Dns01 { .. }, None) => {
                return Err(AcmeError::NoDnsProvider(data.domain.clone()));
            }
        }
        Ok(())
    }

    /// DNS_CHALLENGE_WAIT: trigger the challenge once the record resolves
    async fn check_dns_record(&self, data: &mut CertificateData) -> Result<(), AcmeError> {
        let challenge = data
            .pending_challenge()?
            .filter(|c| c.kind() == ChallengeKind::Dns01);
        let (Some(challenge), Some(dns)) = (challenge, self.dns.as_ref()) else {
            warn!(domain = %data.domain, "No DNS-01 challenge in progress");
            data.state = State::RequestFailed;
            return Ok(());
        };
        let digest = challenge.dns_digest().unwrap_or_default().to_string();

        if dns.is_record_visible(&data.domain, &digest).await {
            debug!(domain = %data.domain, "DNS-01 record visible, triggering challenge");
            self.driver
                .trigger_challenge(&data.order_location, &challenge)
                .await?;
            data.state = State::Verifying;
            return Ok(());
        }

        data.dns_challenge_attempts += 1;
        let limit = self.certificates.load().dns_challenge_reachability_limit;
        if data.dns_challenge_attempts >= limit {
            let error = AcmeError::AttemptLimitExceeded {
                domain: data.domain.clone(),
                attempts: data.dns_challenge_attempts,
            };
            warn!(domain = %data.domain, error = %error, "Giving up on DNS-01 challenge");
            dns.delete_record(&data.domain, &digest).await;
            data.state = State::RequestFailed;
        } else {
            trace!(
                domain = %data.domain,
                attempts = data.dns_challenge_attempts,
                limit,
                "DNS-01 record not visible yet"
            );
        }
        Ok(())
    }

    /// VERIFYING: poll the challenge; cleanup happens on either outcome
    async fn check_challenge(&self, data: &mut CertificateData) -> Result<(), AcmeError> {
        let Some(challenge) = data.pending_challenge()? else {
            warn!(domain = %data.domain, "No challenge in progress");
            data.state = State::RequestFailed;
            return Ok(());
        };

        let next = match self
            .driver
            .check_challenge(&data.order_location, &challenge)
            .await?
        {
            AcmeStatus::Valid => State::Verified,
            AcmeStatus::Invalid => {
                let error = AcmeError::VerificationFailed {
                    domain: data.domain.clone(),
                    message: "challenge rejected by the ACME server".to_string(),
                };
                warn!(domain = %data.domain, error = %error, "Challenge failed");
                State::RequestFailed
            }
            status => {
                trace!(domain = %data.domain, status = ?status, "Challenge not validated yet");
                return Ok(());
            }
        };

        match &challenge {
            PendingChallenge::Http01 { token, .. } => self.challenges.remove_challenge(token),
            PendingChallenge::Dns01 { digest, .. } => {
                if let Some(dns) = &self.dns {
                    dns.delete_record(&data.domain, digest).await;
                }
            }
        }
        data.set_pending_challenge(None);
        data.state = next;
        Ok(())
    }

    /// VERIFIED: submit the CSR with the domain's key pair
    async fn order_certificate(&self, data: &mut CertificateData) -> Result<(), AcmeError> {
        if data.order_location.is_empty() {
            warn!(domain = %data.domain, "No order in progress");
            data.state = State::RequestFailed;
            return Ok(());
        }

        let key_pair = self.load_or_create_key_pair(&data.domain)?;
        self.driver
            .order_certificate(&data.order_location, &data.domain, &key_pair)
            .await?;
        data.state = State::Ordering;
        Ok(())
    }

    /// ORDERING: fetch the chain once the order is valid
    async fn check_order(&self, data: &mut CertificateData) -> Result<(), AcmeError> {
        if data.order_location.is_empty() {
            warn!(domain = %data.domain, "No order in progress");
            data.state = State::RequestFailed;
            return Ok(());
        }

        match self.driver.check_order(&data.order_location).await? {
            AcmeStatus::Valid => {
                let chain = self.driver.fetch_certificate(&data.order_location).await?;
                data.set_chain_pem(&chain);
                data.clear_order();
                data.state = State::Available;

                match data.certificate_info() {
                    Ok(Some(info)) => info!(
                        domain = %data.domain,
                        serial = %info.serial_number,
                        not_after = %info.not_after,
                        "Certificate issued"
                    ),
                    _ => info!(domain = %data.domain, "Certificate issued"),
                }
            }
            AcmeStatus::Invalid => {
                let error = AcmeError::VerificationFailed {
                    domain: data.domain.clone(),
                    message: "order rejected by the ACME server".to_string(),
                };
                warn!(domain = %data.domain, error = %error, "Order failed");
                data.state = State::RequestFailed;
            }
            status => {
                trace!(domain = %data.domain, status = ?status, "Order not ready yet");
            }
        }
        Ok(())
    }

    fn load_or_create_key_pair(&self, domain: &str) -> Result<DomainKeyPair, AcmeError> {
        if let Some(key_pair) = self.store.load_key_pair_for_domain(domain)? {
            return Ok(key_pair);
        }
        let key_pair = DomainKeyPair::generate()?;
        self.store.save_key_pair_for_domain(domain, &key_pair)?;
        debug!(domain = %domain, "Generated domain key pair");
        Ok(key_pair)
    }
}

impl fmt::Debug for CertificateStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateStateMachine")
            .field("store", &self.store)
            .field("dns", &self.dns)
            .field("certificates", &self.certificates.load().certificates.len())
            .finish_non_exhaustive()
    }
}
