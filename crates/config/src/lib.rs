//! Configuration for the certfleet certificate engine.
//!
//! Configuration is written in KDL:
//!
//! ```kdl
//! acme {
//!     email "admin@example.com"
//!     staging #false
//! }
//!
//! certificates {
//!     period-secs 30
//!     dns-challenge-reachability-limit 10
//!     certificate "example.com" { mode "acme"; days-before-renewal 30; }
//!     certificate "*.example.com" { mode "acme"; }
//!     certificate "legacy.example.com" { mode "manual"; }
//! }
//!
//! route53 {
//!     access-key "AKIA..."
//!     secret-key "..."
//! }
//! ```
//!
//! A configuration is only usable after [`Config::validate`] succeeds; any
//! invalid certificate entry rejects the whole configuration.

pub mod certificates;
pub mod kdl;
pub mod validate;

use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};
use validator::Validate;

pub use certificates::{
    AcmeConfig, CertificateConfig, CertificateMode, CertificatesConfig, ClusterConfig,
    Route53Config, StorageConfig,
};
pub use validate::{ValidationError, ValidationResult, ValidationWarning};

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid KDL or has malformed blocks
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// The configuration is well-formed but semantically invalid
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub acme: AcmeConfig,
    pub certificates: CertificatesConfig,
    pub route53: Option<Route53Config>,
    pub storage: StorageConfig,
    pub cluster: Option<ClusterConfig>,
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_kdl(&source)
    }

    /// Parse and validate a KDL document
    pub fn from_kdl(source: &str) -> Result<Self, ConfigError> {
        let config = kdl::parse_document(source).map_err(|e| ConfigError::Parse(format!("{:#}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration
    ///
    /// Field constraints are checked first, then cross-entry rules. All
    /// problems are reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let field_checks = [
            self.acme.validate(),
            self.certificates.validate(),
            self.route53.as_ref().map_or(Ok(()), |r| r.validate()),
            self.cluster.as_ref().map_or(Ok(()), |c| c.validate()),
        ];
        for check in field_checks {
            if let Err(errors) = check {
                problems.push(errors.to_string());
            }
        }

        let mut result = validate::validate_certificates(self);
        result.merge(validate::validate_cluster(self));
        problems.extend(result.errors.iter().map(|e| e.to_string()));

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Best-practice warnings; never rejects a configuration
    pub fn lint(&self) -> Vec<ValidationWarning> {
        let result = validate::lint_config(self);
        for warning in &result.warnings {
            warn!(warning = %warning.message, "Configuration lint");
        }
        result.warnings
    }
}

impl CertificatesConfig {
    /// Validate this table on its own, as done before a runtime reload
    pub fn validate_table(&self, has_dns_provider: bool) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if let Err(errors) = Validate::validate(self) {
            problems.push(errors.to_string());
        }
        let result = validate::validate_certificate_table(self, has_dns_provider);
        problems.extend(result.errors.iter().map(|e| e.to_string()));

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
