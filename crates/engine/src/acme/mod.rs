//! ACME certificate lifecycle
//!
//! Obtains and renews certificates for every configured domain, persisting
//! progress after each step so that a restarted node, or any other node of
//! the cluster, picks up where the last step left off.
//!
//! # Architecture
//!
//! - [`AcmeDriver`] - Single-step ACME operations, implemented by [`AcmeClient`]
//! - [`CertificateStore`] - Certificate records, domain keys and account credentials
//! - [`ChallengeManager`] / [`Http01Responder`] - Answers HTTP-01 validation requests
//! - [`Dns01Provisioner`] - Publishes DNS-01 records for wildcard domains
//! - [`CertificateStateMachine`] - Per-domain transitions
//! - [`ReconciliationLoop`] - Periodic driver and change notifications
//!
//! # Example
//!
//! ```kdl
//! acme {
//!     email "admin@example.com"
//!     staging #false
//! }
//!
//! certificates {
//!     period-secs 30
//!     certificate "example.com" { mode "acme"; days-before-renewal 30; }
//!     certificate "*.example.com" { mode "acme"; }
//! }
//!
//! storage {
//!     path "/var/lib/certfleet"
//! }
//! ```
//!
//! # Challenge Flow
//!
//! For an HTTP-01 domain:
//!
//! 1. `WAITING`: an order is created and its challenge registered with the
//!    [`ChallengeManager`] and stored with the record, then triggered
//! 2. The ACME server requests `/.well-known/acme-challenge/<token>` from any
//!    node; [`Http01Responder`] answers with the key authorization
//! 3. `VERIFYING`: the challenge is polled until valid
//! 4. `VERIFIED`: a CSR signed with the domain key is submitted
//! 5. `ORDERING`: the order is polled and the chain stored once valid
//!
//! Wildcard domains publish a TXT record instead and wait in
//! `DNS_CHALLENGE_WAIT` until it resolves before triggering the challenge.

mod challenge;
mod client;
pub mod dns;
mod error;
mod manager;
mod scheduler;
mod state;
mod storage;

pub use challenge::{ChallengeManager, Http01Responder, ACME_CHALLENGE_PREFIX};
pub use client::{directory_url, AcmeClient, AcmeDriver, AcmeStatus};
pub use dns::{Dns01Provisioner, DnsProvider, DnsProviderError, RecordVisibility};
pub use error::{AcmeError, StorageError};
pub use manager::{CertificateStateMachine, DomainCertificate};
pub use scheduler::{
    log_changes, CertificatesChanged, ChangeOrigin, ReconciliationLoop, TickReport,
    CERTIFICATES_CHANGED_EVENT,
};
pub use state::{
    encode_chain, is_wildcard, parse_leaf_certificate, CertificateData, CertificateInfo,
    ChallengeKind, DynamicCertificateState, PendingChallenge, WILDCARD_PREFIX,
};
pub use storage::{CertificateStore, DomainKeyPair, FileCertificateStore, MemoryCertificateStore};
