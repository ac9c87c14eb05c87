//! Certfleet Engine Library
//!
//! Distributed TLS certificate lifecycle for a fleet of proxy nodes.
//!
//! This library provides:
//!
//! - **ACME**: Per-domain state machine for issuing and renewing certificates
//!   through HTTP-01 and DNS-01 (Route53) challenges
//! - **Storage**: Durable certificate records shared by every node
//! - **Cluster**: Membership, cross-node events and per-peer metadata
//! - **Reconciliation**: Periodic driver advancing every configured domain
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use certfleet_engine::acme::{
//!     AcmeClient, CertificateStateMachine, ChallengeManager, FileCertificateStore,
//!     ReconciliationLoop,
//! };
//! use certfleet_engine::cluster::SingleNodeCoordinator;
//!
//! let store = Arc::new(FileCertificateStore::new(&config.storage.path)?);
//! let client = Arc::new(AcmeClient::new(&config.acme, store.clone()));
//! let machine = Arc::new(CertificateStateMachine::new(client, store, None, ChallengeManager::new()));
//! machine.reload_configuration(&config.certificates)?;
//!
//! let coordinator = Arc::new(SingleNodeCoordinator::new(peer_id));
//! let reconciler = ReconciliationLoop::new(machine, coordinator);
//! reconciler.run(shutdown_rx).await;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod cluster;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Certificate lifecycle
pub use acme::{
    AcmeClient, AcmeDriver, AcmeError, CertificateData, CertificateStateMachine,
    CertificateStore, DynamicCertificateState, Http01Responder, ReconciliationLoop,
};

// Cluster coordination
pub use cluster::{ClusterCoordinator, EventCallback, GroupCoordinator, SingleNodeCoordinator};
