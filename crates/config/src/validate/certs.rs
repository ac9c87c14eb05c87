//! Certificate entry validation
//!
//! Validates hostnames, duplicate entries, and that wildcard ACME
//! certificates have a DNS provider to satisfy DNS-01 challenges.

use std::collections::HashSet;

use super::{ErrorCategory, ValidationError, ValidationResult};
use crate::certificates::{CertificatesConfig, WILDCARD_PREFIX};
use crate::Config;

/// Validate configured certificates
pub fn validate_certificates(config: &Config) -> ValidationResult {
    validate_certificate_table(&config.certificates, config.route53.is_some())
}

/// Validate a certificate table against the available DNS provider
///
/// Used both at load time and when the table is swapped at runtime.
pub fn validate_certificate_table(
    certificates: &CertificatesConfig,
    has_dns_provider: bool,
) -> ValidationResult {
    let mut result = ValidationResult::new();
    let mut seen = HashSet::new();

    for cert in &certificates.certificates {
        if let Err(message) = check_hostname(&cert.hostname) {
            result.add_error(ValidationError::new(ErrorCategory::Certificate, message));
            continue;
        }

        if !seen.insert(cert.hostname.to_ascii_lowercase()) {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!("Duplicate certificate hostname '{}'", cert.hostname),
            ));
        }
    }

    if certificates.has_wildcard_acme() && !has_dns_provider {
        result.add_error(ValidationError::new(
            ErrorCategory::DnsProvider,
            "Wildcard ACME certificates require a 'route53' block for DNS-01 challenges",
        ));
    }

    result
}

/// Check a hostname, allowing a single leading wildcard label
fn check_hostname(hostname: &str) -> Result<(), String> {
    let trimmed = hostname.trim();
    if trimmed.is_empty() {
        return Err("Certificate hostname must not be empty".to_string());
    }
    if trimmed != hostname {
        return Err(format!(
            "Certificate hostname '{}' has surrounding whitespace",
            hostname
        ));
    }

    let base = hostname.strip_prefix(WILDCARD_PREFIX).unwrap_or(hostname);
    if base.contains('*') {
        return Err(format!(
            "Certificate hostname '{}' may only contain a single leading '*.' wildcard",
            hostname
        ));
    }

    for label in base.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!(
                "Certificate hostname '{}' has an empty or oversized label",
                hostname
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!(
                "Certificate hostname '{}' has a label starting or ending with '-'",
                hostname
            ));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!(
                "Certificate hostname '{}' contains invalid characters",
                hostname
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificates::{CertificateConfig, CertificateMode, Route53Config};

    fn config_with(hosts: &[(&str, CertificateMode)]) -> Config {
        let mut config = Config::default();
        for (host, mode) in hosts {
            config
                .certificates
                .certificates
                .push(CertificateConfig::new(*host, *mode, 30));
        }
        config
    }

    #[test]
    fn test_valid_hostnames() {
        assert!(check_hostname("example.com").is_ok());
        assert!(check_hostname("*.example.com").is_ok());
        assert!(check_hostname("localhost").is_ok());
        assert!(check_hostname("a-b.example.com").is_ok());
    }

    #[test]
    fn test_invalid_hostnames() {
        assert!(check_hostname("").is_err());
        assert!(check_hostname(" example.com").is_err());
        assert!(check_hostname("*.*.example.com").is_err());
        assert!(check_hostname("foo.*.example.com").is_err());
        assert!(check_hostname("example..com").is_err());
        assert!(check_hostname("-bad.example.com").is_err());
        assert!(check_hostname("sp ace.example.com").is_err());
    }

    #[test]
    fn test_duplicate_hostnames_rejected() {
        let config = config_with(&[
            ("example.com", CertificateMode::Acme),
            ("EXAMPLE.com", CertificateMode::Manual),
        ]);
        let result = validate_certificates(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("Duplicate")));
    }

    #[test]
    fn test_wildcard_acme_requires_route53() {
        let mut config = config_with(&[("*.example.com", CertificateMode::Acme)]);
        assert!(!validate_certificates(&config).is_ok());

        config.route53 = Some(Route53Config {
            access_key: "key".to_string(),
            secret_key: "secret".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
        });
        assert!(validate_certificates(&config).is_ok());
    }

    #[test]
    fn test_manual_wildcard_needs_no_provider() {
        let config = config_with(&[("*.example.com", CertificateMode::Manual)]);
        assert!(validate_certificates(&config).is_ok());
    }
}
