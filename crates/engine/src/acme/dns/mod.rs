//! DNS-01 challenge support for ACME
//!
//! Wildcard domains can only be validated through DNS-01, so every wildcard
//! certificate goes through this module.
//!
//! # Architecture
//!
//! - [`DnsProvider`] - Trait for DNS provider implementations
//! - [`RecordVisibility`] - Trait answering whether a record resolves yet
//! - [`Dns01Provisioner`] - Single-step create / check / delete operations
//! - [`PropagationChecker`] - hickory-backed [`RecordVisibility`]
//! - [`Route53Provider`] - AWS Route53 API
//!
//! # Example
//!
//! ```kdl
//! route53 {
//!     access-key "AKIA..."
//!     secret-key "..."
//!     region "us-east-1"
//! }
//! ```

pub mod challenge;
mod propagation;
mod provider;
mod route53;

pub use challenge::{compute_challenge_value, Dns01Provisioner};
pub use propagation::{PropagationChecker, PropagationConfig};
pub use provider::{
    challenge_record_fqdn, normalize_domain, DnsProvider, DnsProviderError, DnsResult,
    RecordVisibility, ACME_CHALLENGE_RECORD, CHALLENGE_TTL,
};
pub use route53::Route53Provider;
