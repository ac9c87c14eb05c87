//! Cluster coordination
//!
//! Every node of a cluster shares the same certificate store; this module
//! adds what a store cannot provide: who is currently in the cluster, a way to
//! nudge the other nodes ("certificates changed, reload"), and a small
//! metadata record per node.
//!
//! - [`GroupCoordinator`] runs over a [`CoordinationService`]
//! - [`SingleNodeCoordinator`] is used when no cluster is configured
//! - [`MemoryEnsemble`] is an in-process [`CoordinationService`]
//! - [`CoordinationServer`] serves a [`MemoryEnsemble`] over TCP and
//!   [`RemoteEnsemble`] is its client, used by multi-host clusters

mod group;
mod memory;
pub mod protocol;
mod remote;
mod server;
pub mod service;
mod single;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use certfleet_common::PeerId;

pub use group::{GroupCoordinator, EVENT_RETENTION};
pub use memory::{MemoryEnsemble, MemorySession};
pub use remote::{RemoteEnsemble, RemoteSession};
pub use server::CoordinationServer;
pub use service::{
    CoordinationError, CoordinationService, CoordinationSession, CreateMode, SessionHandle,
    SessionNotification, SessionState, WatchedEvent, WatchedEventKind,
};
pub use single::SingleNodeCoordinator;

/// Operator-supplied metadata stored per peer
pub type PeerInfo = BTreeMap<String, String>;

/// Receiver of cluster events
///
/// Invoked on the coordinator's notification task; implementations must
/// return quickly and defer heavy work.
pub trait EventCallback: Send + Sync {
    /// A peer fired `event_id`
    fn event_fired(&self, event_id: &str);

    /// The coordination session was re-established after a disconnect
    fn reconnected(&self);
}

/// Cluster membership, events and peer metadata
#[async_trait]
pub trait ClusterCoordinator: Send + Sync {
    fn local_peer_id(&self) -> &PeerId;

    /// Current members in join order
    ///
    /// Never fails: during a disconnect the last known view is returned.
    fn peers(&self) -> Vec<PeerId>;

    /// Notify watchers of `event_id` on every other node
    async fn fire_event(&self, event_id: &str) -> Result<(), CoordinationError>;

    /// Register a callback for `event_id`; fires of this node are never delivered to it
    async fn watch_event(
        &self,
        event_id: &str,
        callback: Arc<dyn EventCallback>,
    ) -> Result<(), CoordinationError>;

    /// Publish this node's metadata; `None` discards it
    async fn store_local_peer_info(&self, info: Option<PeerInfo>) -> Result<(), CoordinationError>;

    /// Metadata published by a peer, `None` if absent
    async fn load_info_for_peer(&self, peer_id: &PeerId) -> Result<Option<PeerInfo>, CoordinationError>;

    /// Leave the cluster
    async fn close(&self);
}
