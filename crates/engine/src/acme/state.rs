//! Certificate records and lifecycle states
//!
//! A [`CertificateData`] record exists per configured domain and is the
//! unit persisted by the [`CertificateStore`](super::CertificateStore).

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::AcmeError;

/// Wildcard marker at the start of a domain
pub const WILDCARD_PREFIX: &str = "*.";

/// Lifecycle state of a dynamically managed certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DynamicCertificateState {
    /// Waiting to start a new order
    Waiting,
    /// DNS-01 record created, waiting for it to become visible
    DnsChallengeWait,
    /// Challenge triggered, waiting for the ACME server to validate it
    Verifying,
    /// Challenge valid, certificate can be ordered
    Verified,
    /// CSR submitted, waiting for the order to become valid
    Ordering,
    /// Order or challenge failed; restarts from `Waiting`
    RequestFailed,
    /// Certificate issued and in use
    Available,
    /// Certificate expired or due for renewal
    Expired,
}

impl DynamicCertificateState {
    /// All states in lifecycle order
    pub const ALL: [DynamicCertificateState; 8] = [
        DynamicCertificateState::Waiting,
        DynamicCertificateState::DnsChallengeWait,
        DynamicCertificateState::Verifying,
        DynamicCertificateState::Verified,
        DynamicCertificateState::Ordering,
        DynamicCertificateState::RequestFailed,
        DynamicCertificateState::Available,
        DynamicCertificateState::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DynamicCertificateState::Waiting => "WAITING",
            DynamicCertificateState::DnsChallengeWait => "DNS_CHALLENGE_WAIT",
            DynamicCertificateState::Verifying => "VERIFYING",
            DynamicCertificateState::Verified => "VERIFIED",
            DynamicCertificateState::Ordering => "ORDERING",
            DynamicCertificateState::RequestFailed => "REQUEST_FAILED",
            DynamicCertificateState::Available => "AVAILABLE",
            DynamicCertificateState::Expired => "EXPIRED",
        }
    }

    /// Parse the persisted name of a state
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }
}

impl fmt::Display for DynamicCertificateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Challenge type used to prove control of a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    Http01,
    Dns01,
}

impl ChallengeKind {
    /// Wildcard domains can only be validated through DNS-01
    pub fn for_domain(domain: &str) -> Self {
        if is_wildcard(domain) {
            ChallengeKind::Dns01
        } else {
            ChallengeKind::Http01
        }
    }
}

/// In-flight challenge, persisted as the record's pending challenge data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PendingChallenge {
    /// Token served at `/.well-known/acme-challenge/{token}`
    #[serde(rename = "http-01")]
    Http01 {
        url: String,
        token: String,
        key_authorization: String,
    },
    /// Digest published as the `_acme-challenge` TXT record
    #[serde(rename = "dns-01")]
    Dns01 { url: String, digest: String },
}

impl PendingChallenge {
    /// Challenge URL on the ACME server
    pub fn url(&self) -> &str {
        match self {
            PendingChallenge::Http01 { url, .. } | PendingChallenge::Dns01 { url, .. } => url,
        }
    }

    /// TXT value of a DNS-01 challenge
    pub fn dns_digest(&self) -> Option<&str> {
        match self {
            PendingChallenge::Dns01 { digest, .. } => Some(digest),
            PendingChallenge::Http01 { .. } => None,
        }
    }

    pub fn kind(&self) -> ChallengeKind {
        match self {
            PendingChallenge::Http01 { .. } => ChallengeKind::Http01,
            PendingChallenge::Dns01 { .. } => ChallengeKind::Dns01,
        }
    }
}

/// Details extracted from an issued certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub not_after: DateTime<Utc>,
    pub serial_number: String,
}

pub fn is_wildcard(domain: &str) -> bool {
    domain.starts_with(WILDCARD_PREFIX)
}

fn default_days_before_renewal() -> u32 {
    30
}

/// Persisted state of one configured domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateData {
    pub domain: String,
    pub state: DynamicCertificateState,
    /// Base64 of the PEM certificate chain, empty until issued
    #[serde(default)]
    pub chain: String,
    /// URL of the in-flight ACME order, empty when idle
    #[serde(default)]
    pub order_location: String,
    /// JSON of the in-flight [`PendingChallenge`], empty when idle
    #[serde(default)]
    pub pending_challenge_data: String,
    /// Lifecycle managed by an operator rather than the engine
    #[serde(default)]
    pub manual: bool,
    #[serde(default = "default_days_before_renewal")]
    pub days_before_renewal: u32,
    /// DNS-01 visibility checks performed for the current challenge
    #[serde(default)]
    pub dns_challenge_attempts: u32,
}

impl CertificateData {
    pub fn new(
        domain: impl Into<String>,
        state: DynamicCertificateState,
        chain: impl Into<String>,
        manual: bool,
        days_before_renewal: u32,
    ) -> Self {
        Self {
            domain: domain.into(),
            state,
            chain: chain.into(),
            order_location: String::new(),
            pending_challenge_data: String::new(),
            manual,
            days_before_renewal,
            dns_challenge_attempts: 0,
        }
    }

    /// A fresh record for a newly configured ACME domain
    pub fn waiting(domain: impl Into<String>, days_before_renewal: u32) -> Self {
        Self::new(
            domain,
            DynamicCertificateState::Waiting,
            String::new(),
            false,
            days_before_renewal,
        )
    }

    pub fn is_wildcard(&self) -> bool {
        is_wildcard(&self.domain)
    }

    pub fn challenge_kind(&self) -> ChallengeKind {
        ChallengeKind::for_domain(&self.domain)
    }

    /// Decode the pending challenge, if any
    pub fn pending_challenge(&self) -> Result<Option<PendingChallenge>, AcmeError> {
        if self.pending_challenge_data.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&self.pending_challenge_data)
            .map(Some)
            .map_err(|e| {
                AcmeError::Protocol(format!(
                    "Corrupt pending challenge for '{}': {}",
                    self.domain, e
                ))
            })
    }

    pub fn set_pending_challenge(&mut self, challenge: Option<&PendingChallenge>) {
        self.pending_challenge_data = challenge
            .and_then(|c| serde_json::to_string(c).ok())
            .unwrap_or_default();
    }

    /// Forget the in-flight order and challenge
    pub fn clear_order(&mut self) {
        self.order_location.clear();
        self.pending_challenge_data.clear();
        self.dns_challenge_attempts = 0;
    }

    /// Store a PEM chain in its encoded form
    pub fn set_chain_pem(&mut self, chain_pem: &str) {
        self.chain = encode_chain(chain_pem);
    }

    /// Decoded PEM chain, if one has been issued
    pub fn chain_pem(&self) -> Result<Option<String>, AcmeError> {
        if self.chain.is_empty() {
            return Ok(None);
        }
        let bytes = STANDARD
            .decode(self.chain.as_bytes())
            .map_err(|e| AcmeError::CertificateParse(format!("Invalid chain encoding: {}", e)))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| AcmeError::CertificateParse(format!("Chain is not UTF-8: {}", e)))
    }

    /// Expiry and serial number of the leaf certificate
    ///
    /// Parsed on demand from the chain; nothing is cached.
    pub fn certificate_info(&self) -> Result<Option<CertificateInfo>, AcmeError> {
        match self.chain_pem()? {
            Some(pem) => parse_leaf_certificate(&pem).map(Some),
            None => Ok(None),
        }
    }

    /// Whether the certificate is expired or inside its renewal window
    ///
    /// A missing or unreadable chain counts as due, so the record recovers by
    /// issuing a new certificate. So does a renewal window reaching past the
    /// representable date range.
    pub fn is_expired_or_due(&self, now: DateTime<Utc>) -> bool {
        match self.certificate_info() {
            Ok(Some(info)) => Duration::try_days(i64::from(self.days_before_renewal))
                .and_then(|window| now.checked_add_signed(window))
                .is_none_or(|renew_at| renew_at >= info.not_after),
            Ok(None) | Err(_) => true,
        }
    }
}

/// Encode a PEM chain for storage in [`CertificateData::chain`]
pub fn encode_chain(chain_pem: &str) -> String {
    STANDARD.encode(chain_pem.as_bytes())
}

/// Parse the first certificate of a PEM chain
pub fn parse_leaf_certificate(chain_pem: &str) -> Result<CertificateInfo, AcmeError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(chain_pem.as_bytes())
        .map_err(|e| AcmeError::CertificateParse(format!("Failed to parse PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| AcmeError::CertificateParse(format!("Failed to parse certificate: {}", e)))?;

    let timestamp = cert.validity().not_after.timestamp();
    let not_after = DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| AcmeError::CertificateParse("Invalid expiry timestamp".to_string()))?;

    Ok(CertificateInfo {
        not_after,
        serial_number: cert.raw_serial_as_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chain(not_after_year: i32) -> String {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(not_after_year, 1, 1);
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in DynamicCertificateState::ALL {
            assert_eq!(DynamicCertificateState::parse(state.as_str()), Some(state));
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert_eq!(DynamicCertificateState::parse("BOGUS"), None);
    }

    #[test]
    fn test_challenge_kind_for_domain() {
        assert_eq!(ChallengeKind::for_domain("example.com"), ChallengeKind::Http01);
        assert_eq!(ChallengeKind::for_domain("*.example.com"), ChallengeKind::Dns01);
    }

    #[test]
    fn test_pending_challenge_is_tagged() {
        let challenge = PendingChallenge::Dns01 {
            url: "https://acme.test/chall/1".to_string(),
            digest: "abc".to_string(),
        };
        let json = serde_json::to_value(&challenge).unwrap();
        assert_eq!(json["type"], "dns-01");

        let mut data = CertificateData::waiting("*.example.com", 30);
        assert_eq!(data.pending_challenge().unwrap(), None);
        data.set_pending_challenge(Some(&challenge));
        assert_eq!(data.pending_challenge().unwrap(), Some(challenge));

        data.order_location = "https://acme.test/order/1".to_string();
        data.dns_challenge_attempts = 2;
        data.clear_order();
        assert!(data.order_location.is_empty());
        assert!(data.pending_challenge_data.is_empty());
        assert_eq!(data.dns_challenge_attempts, 0);
    }

    #[test]
    fn test_certificate_info_from_chain() {
        let mut data = CertificateData::waiting("example.com", 30);
        assert_eq!(data.certificate_info().unwrap(), None);

        data.set_chain_pem(&sample_chain(2100));
        let info = data.certificate_info().unwrap().unwrap();
        assert_eq!(info.not_after.format("%Y").to_string(), "2100");
        assert!(!info.serial_number.is_empty());
    }

    #[test]
    fn test_expiry_window() {
        let mut data = CertificateData::waiting("example.com", 0);
        data.set_chain_pem(&sample_chain(2100));
        assert!(!data.is_expired_or_due(Utc::now()));

        data.set_chain_pem(&sample_chain(2001));
        assert!(data.is_expired_or_due(Utc::now()));
    }

    #[test]
    fn test_huge_renewal_window_is_due() {
        let mut data = CertificateData::new(
            "example.com",
            DynamicCertificateState::Available,
            String::new(),
            false,
            u32::MAX,
        );
        data.set_chain_pem(&sample_chain(2100));
        assert!(data.is_expired_or_due(Utc::now()));

        data.days_before_renewal = 4_000_000_000;
        assert!(data.is_expired_or_due(Utc::now()));
    }

    #[test]
    fn test_missing_or_corrupt_chain_is_due() {
        let mut data = CertificateData::waiting("example.com", 30);
        assert!(data.is_expired_or_due(Utc::now()));

        data.chain = "not base64!".to_string();
        assert!(data.chain_pem().is_err());
        assert!(data.is_expired_or_due(Utc::now()));
    }

    #[test]
    fn test_record_defaults_when_deserializing() {
        let data: CertificateData =
            serde_json::from_str(r#"{"domain":"example.com","state":"WAITING"}"#).unwrap();
        assert_eq!(data.days_before_renewal, 30);
        assert!(!data.manual);
        assert!(data.chain.is_empty());
    }
}
