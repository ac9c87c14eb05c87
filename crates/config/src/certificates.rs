//! Certificate engine configuration model.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Wildcard marker allowed at the start of a hostname
pub const WILDCARD_PREFIX: &str = "*.";

pub fn default_period_secs() -> u64 {
    30
}

pub fn default_days_before_renewal() -> u32 {
    30
}

pub fn default_reachability_limit() -> u32 {
    10
}

pub fn default_route53_region() -> String {
    "us-east-1".to_string()
}

pub fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/certfleet")
}

pub fn default_cluster_root() -> String {
    "/certfleet".to_string()
}

pub fn default_cluster_request_timeout_secs() -> u64 {
    10
}

/// Who manages a certificate's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateMode {
    /// Issued and renewed by the engine through ACME
    #[default]
    Acme,
    /// Uploaded by an operator; the engine only reads it
    Manual,
}

impl CertificateMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "acme" => Some(CertificateMode::Acme),
            "manual" => Some(CertificateMode::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for CertificateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateMode::Acme => write!(f, "acme"),
            CertificateMode::Manual => write!(f, "manual"),
        }
    }
}

/// A single configured certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CertificateConfig {
    #[validate(length(min = 1, max = 253))]
    pub hostname: String,
    #[serde(default)]
    pub mode: CertificateMode,
    /// Renew this many days before expiry; at most one year
    #[validate(range(max = 365))]
    #[serde(default = "default_days_before_renewal")]
    pub days_before_renewal: u32,
}

impl CertificateConfig {
    pub fn new(hostname: impl Into<String>, mode: CertificateMode, days_before_renewal: u32) -> Self {
        Self {
            hostname: hostname.into(),
            mode,
            days_before_renewal,
        }
    }

    /// Wildcard hostnames can only be validated through DNS-01
    pub fn is_wildcard(&self) -> bool {
        self.hostname.starts_with(WILDCARD_PREFIX)
    }

    pub fn is_manual(&self) -> bool {
        self.mode == CertificateMode::Manual
    }
}

/// The `certificates` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CertificatesConfig {
    /// Reconciliation period
    #[validate(range(min = 1))]
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Maximum DNS-01 record visibility checks before giving up on an order
    #[validate(range(min = 1))]
    #[serde(default = "default_reachability_limit")]
    pub dns_challenge_reachability_limit: u32,
    #[validate(nested)]
    #[serde(default)]
    pub certificates: Vec<CertificateConfig>,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            period_secs: default_period_secs(),
            dns_challenge_reachability_limit: default_reachability_limit(),
            certificates: Vec::new(),
        }
    }
}

impl CertificatesConfig {
    pub fn get(&self, hostname: &str) -> Option<&CertificateConfig> {
        self.certificates.iter().find(|c| c.hostname == hostname)
    }

    pub fn has_wildcard_acme(&self) -> bool {
        self.certificates
            .iter()
            .any(|c| c.is_wildcard() && !c.is_manual())
    }
}

/// The `acme` block
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Validate)]
pub struct AcmeConfig {
    /// Contact address registered with the account
    #[validate(email)]
    pub email: Option<String>,
    /// Use the staging directory instead of production
    #[serde(default)]
    pub staging: bool,
    /// Explicit directory URL, overriding `staging`
    #[validate(url)]
    pub directory_url: Option<String>,
}

/// The `route53` block: credentials for the DNS-01 provider
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Route53Config {
    #[validate(length(min = 1))]
    pub access_key: String,
    #[validate(length(min = 1))]
    pub secret_key: String,
    #[serde(default = "default_route53_region")]
    pub region: String,
    /// API endpoint override (defaults to the public Route53 endpoint)
    #[validate(url)]
    pub endpoint: Option<String>,
}

impl fmt::Debug for Route53Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route53Config")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// The `storage` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// The `cluster` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ClusterConfig {
    /// Coordination servers as comma-separated `host:port` pairs
    #[validate(length(min = 1))]
    pub connect_string: String,
    /// Deadline for a single coordination request
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_cluster_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Local peer id; a random one is generated when absent
    pub peer_id: Option<String>,
    /// Root path in the coordination namespace
    #[validate(length(min = 2))]
    #[serde(default = "default_cluster_root")]
    pub root: String,
    /// Operator-supplied metadata published for this peer
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ClusterConfig {
    /// Coordination server addresses, in connection order
    pub fn servers(&self) -> Vec<&str> {
        self.connect_string
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(CertificateMode::parse("acme"), Some(CertificateMode::Acme));
        assert_eq!(CertificateMode::parse("MANUAL"), Some(CertificateMode::Manual));
        assert_eq!(CertificateMode::parse("self-signed"), None);
    }

    #[test]
    fn test_wildcard_detection() {
        assert!(CertificateConfig::new("*.example.com", CertificateMode::Acme, 30).is_wildcard());
        assert!(!CertificateConfig::new("example.com", CertificateMode::Acme, 30).is_wildcard());
    }

    #[test]
    fn test_route53_debug_redacts_secret() {
        let config = Route53Config {
            access_key: "AKIAEXAMPLE".to_string(),
            secret_key: "very-secret".to_string(),
            region: default_route53_region(),
            endpoint: None,
        };
        let debug = format!("{:?}", config);
        assert!(debug.contains("AKIAEXAMPLE"));
        assert!(!debug.contains("very-secret"));
    }

    #[test]
    fn test_period_range_validation() {
        let config = CertificatesConfig {
            period_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(CertificatesConfig::default().validate().is_ok());
    }
}
