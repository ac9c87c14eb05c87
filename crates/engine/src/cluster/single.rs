//! Coordinator for a node running without a cluster

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use certfleet_common::PeerId;

use super::{ClusterCoordinator, CoordinationError, EventCallback, PeerInfo};

/// A cluster of one
///
/// The only peer is the local node. Events have no other node to reach, so
/// firing is a no-op and watchers are never invoked.
#[derive(Debug)]
pub struct SingleNodeCoordinator {
    peer_id: PeerId,
    info: Mutex<Option<PeerInfo>>,
}

impl SingleNodeCoordinator {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            info: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ClusterCoordinator for SingleNodeCoordinator {
    fn local_peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn peers(&self) -> Vec<PeerId> {
        vec![self.peer_id.clone()]
    }

    async fn fire_event(&self, event_id: &str) -> Result<(), CoordinationError> {
        trace!(event = %event_id, "No peers to notify");
        Ok(())
    }

    async fn watch_event(
        &self,
        _event_id: &str,
        _callback: Arc<dyn EventCallback>,
    ) -> Result<(), CoordinationError> {
        Ok(())
    }

    async fn store_local_peer_info(&self, info: Option<PeerInfo>) -> Result<(), CoordinationError> {
        *self.info.lock() = info;
        Ok(())
    }

    async fn load_info_for_peer(&self, peer_id: &PeerId) -> Result<Option<PeerInfo>, CoordinationError> {
        if *peer_id == self.peer_id {
            Ok(self.info.lock().clone())
        } else {
            Ok(None)
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_node_peers_and_info() {
        let coordinator = SingleNodeCoordinator::new(PeerId::new("solo"));
        assert_eq!(coordinator.peers(), vec![PeerId::new("solo")]);

        assert_eq!(
            coordinator.load_info_for_peer(&PeerId::new("solo")).await.unwrap(),
            None
        );

        coordinator
            .store_local_peer_info(Some(PeerInfo::new()))
            .await
            .unwrap();
        assert_eq!(
            coordinator.load_info_for_peer(&PeerId::new("solo")).await.unwrap(),
            Some(PeerInfo::new())
        );
        assert_eq!(
            coordinator.load_info_for_peer(&PeerId::new("other")).await.unwrap(),
            None
        );

        coordinator.store_local_peer_info(None).await.unwrap();
        assert_eq!(
            coordinator.load_info_for_peer(&PeerId::new("solo")).await.unwrap(),
            None
        );

        coordinator.fire_event("certificates-changed").await.unwrap();
    }
}
