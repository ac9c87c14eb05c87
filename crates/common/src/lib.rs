//! Shared building blocks for certfleet crates.
//!
//! Identifier newtypes used across the cluster and certificate layers, plus
//! the tracing subscriber setup shared by binaries.

pub mod ids;
#[cfg(feature = "runtime")]
pub mod observability;

pub use ids::{EventId, PeerId};
