//! Configuration linting for best practices
//!
//! Checks configuration for settings that are legal but likely unintended.

use super::{ValidationResult, ValidationWarning};
use crate::Config;

/// Let's Encrypt certificates are valid for 90 days
const CERTIFICATE_LIFETIME_DAYS: u32 = 90;

/// Lint configuration for best practices
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    for cert in &config.certificates.certificates {
        if cert.is_manual() {
            continue;
        }

        if cert.days_before_renewal >= CERTIFICATE_LIFETIME_DAYS {
            result.add_warning(ValidationWarning::new(format!(
                "Certificate '{}' renews {} days before expiry, which is at least the whole certificate lifetime; it will be renewed on every check",
                cert.hostname, cert.days_before_renewal
            )));
        }

        if cert.days_before_renewal == 0 {
            result.add_warning(ValidationWarning::new(format!(
                "Certificate '{}' is only renewed once expired (days-before-renewal 0)",
                cert.hostname
            )));
        }
    }

    let has_acme = config
        .certificates
        .certificates
        .iter()
        .any(|c| !c.is_manual());

    if has_acme && config.acme.email.is_none() {
        result.add_warning(ValidationWarning::new(
            "No ACME contact email configured (expiry notices cannot be delivered)",
        ));
    }

    if has_acme && config.acme.staging && config.acme.directory_url.is_none() {
        result.add_warning(ValidationWarning::new(
            "ACME staging directory is enabled; issued certificates are not publicly trusted",
        ));
    }

    if config.certificates.period_secs > 3600 {
        result.add_warning(ValidationWarning::new(format!(
            "Reconciliation period of {}s delays challenge progress by that much per step",
            config.certificates.period_secs
        )));
    }

    result
}
