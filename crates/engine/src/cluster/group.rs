//! Cluster coordinator over a coordination service
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── members/
//! │   └── <peer>-0000000007        # ephemeral sequential, one per live node
//! ├── events/
//! │   └── <event id>/
//! │       └── <peer>-0000000012    # one per fire, data = fire time (ms)
//! └── peers/
//!     └── <peer>                   # ephemeral, JSON metadata
//! ```
//!
//! Join order is the sequence number of the member node. Fire nodes carry
//! their origin in the name, so watchers count every fire newer than the last
//! one they saw and skip their own without reading the node. A firer prunes
//! its own fire nodes once they are older than the event retention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use certfleet_common::{EventId, PeerId};

use super::service::{
    child_path, sequence_of, CoordinationError, CoordinationService, CoordinationSession,
    CreateMode, SessionNotification, SessionState, WatchedEvent, WatchedEventKind,
};
use super::{ClusterCoordinator, EventCallback, PeerInfo};

const MEMBERS: &str = "members";
const EVENTS: &str = "events";
const PEERS: &str = "peers";

/// Age after which a firer deletes its own fire nodes
///
/// Watchers disconnected for longer than this miss the pruned fires, but
/// still get `reconnected()`.
pub const EVENT_RETENTION: Duration = Duration::from_secs(300);

/// Delay between attempts to open a replacement session
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Membership, events and peer metadata over a [`CoordinationService`]
pub struct GroupCoordinator {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    service: Arc<dyn CoordinationService>,
    root: String,
    peer_id: PeerId,
    session: RwLock<Arc<dyn CoordinationSession>>,
    /// Last known membership, in join order
    peers: RwLock<Vec<PeerId>>,
    watchers: DashMap<EventId, Vec<Arc<dyn EventCallback>>>,
    /// Sequence of the newest fire already handled, per event
    last_seen: DashMap<EventId, u64>,
    event_retention: Duration,
    /// Re-published after a session expiry
    local_info: Mutex<Option<PeerInfo>>,
    closed: AtomicBool,
}

impl GroupCoordinator {
    /// Join the cluster rooted at `root`
    pub async fn start(
        service: Arc<dyn CoordinationService>,
        root: impl Into<String>,
        peer_id: PeerId,
    ) -> Result<Self, CoordinationError> {
        Self::start_with_event_retention(service, root, peer_id, EVENT_RETENTION).await
    }

    pub async fn start_with_event_retention(
        service: Arc<dyn CoordinationService>,
        root: impl Into<String>,
        peer_id: PeerId,
        event_retention: Duration,
    ) -> Result<Self, CoordinationError> {
        let handle = service.connect().await?;

        let inner = Arc::new(Inner {
            service,
            root: root.into(),
            peer_id,
            session: RwLock::new(handle.session),
            peers: RwLock::new(Vec::new()),
            watchers: DashMap::new(),
            last_seen: DashMap::new(),
            event_retention,
            local_info: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        inner.register().await?;

        let task = tokio::spawn(notification_loop(inner.clone(), handle.notifications));

        info!(
            peer_id = %inner.peer_id,
            root = %inner.root,
            peers = ?inner.peers.read().clone(),
            "Joined cluster"
        );

        Ok(Self {
            inner,
            task: Mutex::new(Some(task)),
        })
    }

    /// Id of the current coordination session
    pub fn session_id(&self) -> u64 {
        self.inner.session().session_id()
    }
}

impl Drop for GroupCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ClusterCoordinator for GroupCoordinator {
    fn local_peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.read().clone()
    }

    async fn fire_event(&self, event_id: &str) -> Result<(), CoordinationError> {
        let inner = &self.inner;
        let session = inner.session();
        let path = inner.event_path(event_id);

        session.ensure_path(&path).await?;
        let node = session
            .create(
                &child_path(&path, &sequential_prefix(&inner.peer_id)),
                Utc::now().timestamp_millis().to_string().into_bytes(),
                CreateMode::PersistentSequential,
            )
            .await?;
        debug!(event = %event_id, node = %node, "Fired cluster event");

        if let Err(e) = inner.prune_own_events(session.as_ref(), &path).await {
            debug!(event = %event_id, error = %e, "Failed to prune old event nodes");
        }
        Ok(())
    }

    async fn watch_event(
        &self,
        event_id: &str,
        callback: Arc<dyn EventCallback>,
    ) -> Result<(), CoordinationError> {
        let id = EventId::new(event_id);
        let first = {
            let mut entry = self.inner.watchers.entry(id.clone()).or_default();
            entry.push(callback);
            entry.len() == 1
        };

        if first {
            // Arm the watch; fires before this point are not delivered
            self.inner.poll_event(&id, false).await?;
        }
        debug!(event = %event_id, "Watching cluster event");
        Ok(())
    }

    async fn store_local_peer_info(&self, info: Option<PeerInfo>) -> Result<(), CoordinationError> {
        let inner = &self.inner;
        *inner.local_info.lock() = info.clone();

        let session = inner.session();
        match info {
            Some(info) => inner.write_peer_info(session.as_ref(), &info).await,
            None => {
                let path = inner.peer_path(&inner.peer_id);
                match session.delete(&path).await {
                    Ok(()) | Err(CoordinationError::NoNode(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn load_info_for_peer(&self, peer_id: &PeerId) -> Result<Option<PeerInfo>, CoordinationError> {
        let path = self.inner.peer_path(peer_id);
        match self.inner.session().get_data(&path, false).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(CoordinationError::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.session().close().await;
        info!(peer_id = %self.inner.peer_id, "Left cluster");
    }
}

impl Inner {
    fn session(&self) -> Arc<dyn CoordinationSession> {
        self.session.read().clone()
    }

    fn members_path(&self) -> String {
        child_path(&self.root, MEMBERS)
    }

    fn events_path(&self) -> String {
        child_path(&self.root, EVENTS)
    }

    fn event_path(&self, event_id: &str) -> String {
        child_path(&self.events_path(), &urlencoding::encode(event_id))
    }

    fn peer_path(&self, peer_id: &PeerId) -> String {
        child_path(&child_path(&self.root, PEERS), &urlencoding::encode(peer_id.as_str()))
    }

    /// Create this node's ephemeral entries and arm every watch
    async fn register(&self) -> Result<(), CoordinationError> {
        let session = self.session();

        for dir in [MEMBERS, EVENTS, PEERS] {
            session.ensure_path(&child_path(&self.root, dir)).await?;
        }

        let node = session
            .create(
                &child_path(&self.members_path(), &sequential_prefix(&self.peer_id)),
                self.peer_id.as_str().as_bytes().to_vec(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        debug!(peer_id = %self.peer_id, node = %node, "Registered cluster member");

        let info = self.local_info.lock().clone();
        if let Some(info) = info {
            self.write_peer_info(session.as_ref(), &info).await?;
        }

        self.refresh_members().await?;

        let watched: Vec<EventId> = self.watchers.iter().map(|e| e.key().clone()).collect();
        for id in watched {
            self.poll_event(&id, true).await?;
        }
        Ok(())
    }

    async fn refresh_members(&self) -> Result<(), CoordinationError> {
        let children = self
            .session()
            .get_children(&self.members_path(), true)
            .await?;
        let peers = peers_in_join_order(&children);

        let changed = *self.peers.read() != peers;
        if changed {
            info!(peer_id = %self.peer_id, peers = ?peers, "Cluster membership changed");
            *self.peers.write() = peers;
        }
        Ok(())
    }

    /// Re-arm the watch on an event and optionally deliver new fires
    async fn poll_event(&self, id: &EventId, deliver: bool) -> Result<(), CoordinationError> {
        let session = self.session();
        let path = self.event_path(id.as_str());

        session.ensure_path(&path).await?;
        let children = session.get_children(&path, true).await?;

        let last = self.last_seen.get(id).map(|v| *v);
        let mut fresh: Vec<(u64, PeerId)> = children
            .iter()
            .filter_map(|name| sequenced_peer(name))
            .filter(|(sequence, _)| last.is_none_or(|last| *sequence > last))
            .collect();
        fresh.sort_by_key(|(sequence, _)| *sequence);

        if let Some((newest, _)) = fresh.last() {
            self.last_seen.insert(id.clone(), *newest);
        }
        if !deliver {
            return Ok(());
        }

        for (sequence, origin) in fresh {
            if origin == self.peer_id {
                trace!(event = %id, sequence, "Skipping own event");
                continue;
            }

            let callbacks = self.watchers.get(id).map(|w| w.clone()).unwrap_or_default();
            debug!(
                event = %id,
                origin = %origin,
                sequence,
                watchers = callbacks.len(),
                "Delivering cluster event"
            );
            for callback in callbacks {
                callback.event_fired(id.as_str());
            }
        }
        Ok(())
    }

    /// Delete this node's fire nodes older than the event retention
    async fn prune_own_events(
        &self,
        session: &dyn CoordinationSession,
        path: &str,
    ) -> Result<(), CoordinationError> {
        let now_ms = Utc::now().timestamp_millis();
        let retention_ms = i64::try_from(self.event_retention.as_millis()).unwrap_or(i64::MAX);

        for name in session.get_children(path, false).await? {
            if !sequenced_peer(&name).is_some_and(|(_, origin)| origin == self.peer_id) {
                continue;
            }
            let node = child_path(path, &name);
            let fired_at = match session.get_data(&node, false).await {
                Ok(data) => String::from_utf8_lossy(&data).parse::<i64>().ok(),
                Err(CoordinationError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            };
            let expired = fired_at.is_none_or(|at| now_ms.saturating_sub(at) >= retention_ms);
            if !expired {
                continue;
            }
            match session.delete(&node).await {
                Ok(()) | Err(CoordinationError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn write_peer_info(
        &self,
        session: &dyn CoordinationSession,
        info: &PeerInfo,
    ) -> Result<(), CoordinationError> {
        let path = self.peer_path(&self.peer_id);
        let data = serde_json::to_vec(info)?;

        match session.set_data(&path, data.clone()).await {
            Ok(()) => Ok(()),
            Err(CoordinationError::NoNode(_)) => {
                match session.create(&path, data.clone(), CreateMode::Ephemeral).await {
                    Ok(_) => Ok(()),
                    Err(CoordinationError::NodeExists(_)) => session.set_data(&path, data).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_watch(&self, event: WatchedEvent) {
        if event.kind != WatchedEventKind::NodeChildrenChanged {
            trace!(path = %event.path, kind = ?event.kind, "Ignoring watch notification");
            return;
        }

        if event.path == self.members_path() {
            if let Err(e) = self.refresh_members().await {
                warn!(error = %e, "Failed to refresh cluster membership");
            }
            return;
        }

        let events_prefix = child_path(&self.events_path(), "");
        let Some(encoded) = event.path.strip_prefix(&events_prefix) else {
            return;
        };
        let Ok(decoded) = urlencoding::decode(encoded) else {
            return;
        };
        let id = EventId::new(decoded.into_owned());
        if !self.watchers.contains_key(&id) {
            return;
        }
        if let Err(e) = self.poll_event(&id, true).await {
            warn!(event = %id, error = %e, "Failed to read cluster event");
        }
    }

    fn notify_reconnected(&self) {
        let callbacks: Vec<Arc<dyn EventCallback>> = self
            .watchers
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        for callback in callbacks {
            callback.reconnected();
        }
    }

    /// Open a new session after expiry and register again
    ///
    /// Retries until it succeeds or the coordinator is closed.
    async fn reestablish(&self) -> Option<mpsc::UnboundedReceiver<SessionNotification>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            match self.service.connect().await {
                Ok(handle) => {
                    *self.session.write() = handle.session;
                    match self.register().await {
                        Ok(()) => {
                            info!(
                                peer_id = %self.peer_id,
                                session_id = self.session().session_id(),
                                "Re-registered with coordination service"
                            );
                            return Some(handle.notifications);
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to re-register with coordination service");
                            self.session().close().await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to open coordination session");
                }
            }

            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }
}

async fn notification_loop(
    inner: Arc<Inner>,
    mut notifications: mpsc::UnboundedReceiver<SessionNotification>,
) {
    let mut disconnected = false;

    while let Some(notification) = notifications.recv().await {
        match notification {
            SessionNotification::Watch(event) => inner.handle_watch(event).await,
            SessionNotification::State(SessionState::Disconnected) => {
                warn!(peer_id = %inner.peer_id, "Coordination session disconnected");
                disconnected = true;
            }
            SessionNotification::State(SessionState::Connected) => {
                if disconnected {
                    disconnected = false;
                    info!(peer_id = %inner.peer_id, "Coordination session reconnected");
                    if let Err(e) = inner.refresh_members().await {
                        warn!(error = %e, "Failed to refresh cluster membership");
                    }
                    inner.notify_reconnected();
                }
            }
            SessionNotification::State(SessionState::Expired) => {
                warn!(peer_id = %inner.peer_id, "Coordination session expired");
                match inner.reestablish().await {
                    Some(rx) => {
                        notifications = rx;
                        disconnected = false;
                        inner.notify_reconnected();
                    }
                    None => break,
                }
            }
            SessionNotification::State(SessionState::Closed) => break,
        }
    }

    debug!(peer_id = %inner.peer_id, "Coordination notification loop stopped");
}

/// Name prefix of a sequential node created by `peer`
fn sequential_prefix(peer: &PeerId) -> String {
    format!("{}-", urlencoding::encode(peer.as_str()))
}

/// Split a `<peer>-<sequence>` node name
fn sequenced_peer(name: &str) -> Option<(u64, PeerId)> {
    let (encoded, _) = name.rsplit_once('-')?;
    let sequence = sequence_of(name)?;
    let peer = urlencoding::decode(encoded).ok()?;
    Some((sequence, PeerId::new(peer.into_owned())))
}

/// Parse member node names into peers ordered by sequence number
fn peers_in_join_order(children: &[String]) -> Vec<PeerId> {
    let mut entries: Vec<(u64, PeerId)> = children
        .iter()
        .filter_map(|name| sequenced_peer(name))
        .collect();
    entries.sort_by_key(|(sequence, _)| *sequence);

    let mut peers: Vec<PeerId> = Vec::with_capacity(entries.len());
    for (_, peer) in entries {
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }
    peers
}
