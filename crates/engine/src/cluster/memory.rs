//! In-process coordination service
//!
//! [`MemoryEnsemble`] implements the full [`CoordinationService`] contract
//! inside one process: every node of a simulated cluster connects to the same
//! ensemble. Sessions can be disconnected, reconnected and expired on demand.
//!
//! While a session is disconnected its operations fail with
//! [`CoordinationError::ConnectionLoss`] and its watch notifications are held
//! back until it reconnects.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::service::{
    child_path, parent_path, CoordinationError, CoordinationService, CoordinationSession,
    CreateMode, SessionHandle, SessionNotification, SessionState, WatchedEvent, WatchedEventKind,
    SEQUENCE_WIDTH,
};

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<u64>,
}

#[derive(Debug)]
struct SessionEntry {
    tx: mpsc::UnboundedSender<SessionNotification>,
    connected: bool,
    /// Notifications held back while disconnected
    pending: Vec<SessionNotification>,
}

impl SessionEntry {
    fn notify(&mut self, notification: SessionNotification) {
        if self.connected {
            let _ = self.tx.send(notification);
        } else {
            self.pending.push(notification);
        }
    }
}

#[derive(Debug)]
struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    /// Next sequence number per parent path
    sequences: HashMap<String, u64>,
    sessions: HashMap<u64, SessionEntry>,
    data_watches: HashMap<String, HashSet<u64>>,
    child_watches: HashMap<String, HashSet<u64>>,
    next_session_id: u64,
}

impl EnsembleState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                ephemeral_owner: None,
            },
        );
        Self {
            nodes,
            sequences: HashMap::new(),
            sessions: HashMap::new(),
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            next_session_id: 1,
        }
    }

    /// Check that a session may issue operations
    fn check_session(&self, session_id: u64) -> Result<(), CoordinationError> {
        match self.sessions.get(&session_id) {
            Some(entry) if entry.connected => Ok(()),
            Some(_) => Err(CoordinationError::ConnectionLoss),
            None => Err(CoordinationError::SessionExpired),
        }
    }

    fn fire(&mut self, watches: WatchKind, path: &str, kind: WatchedEventKind) {
        let registry = match watches {
            WatchKind::Data => &mut self.data_watches,
            WatchKind::Children => &mut self.child_watches,
        };
        let Some(watchers) = registry.remove(path) else {
            return;
        };

        for session_id in watchers {
            if let Some(entry) = self.sessions.get_mut(&session_id) {
                trace!(session_id, path = %path, kind = ?kind, "Firing watch");
                entry.notify(SessionNotification::Watch(WatchedEvent {
                    kind,
                    path: path.to_string(),
                }));
            }
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = child_path(path, "");
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(p, _)| p.starts_with(&prefix))
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = child_path(path, "");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn create(
        &mut self,
        session_id: u64,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        let parent = parent_path(path)
            .ok_or_else(|| CoordinationError::NodeExists(path.to_string()))?
            .to_string();
        if !self.nodes.contains_key(&parent) {
            return Err(CoordinationError::NoNode(parent));
        }

        let actual = if mode.is_sequential() {
            let counter = self.sequences.entry(parent.clone()).or_insert(0);
            let sequence = *counter;
            *counter += 1;
            format!("{}{:0width$}", path, sequence, width = SEQUENCE_WIDTH)
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&actual) {
            return Err(CoordinationError::NodeExists(actual));
        }

        self.nodes.insert(
            actual.clone(),
            Node {
                data,
                ephemeral_owner: mode.is_ephemeral().then_some(session_id),
            },
        );

        self.fire(WatchKind::Data, &actual, WatchedEventKind::NodeCreated);
        self.fire(WatchKind::Children, &parent, WatchedEventKind::NodeChildrenChanged);
        Ok(actual)
    }

    fn delete(&mut self, path: &str) -> Result<(), CoordinationError> {
        if !self.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        if self.has_children(path) {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }

        self.nodes.remove(path);
        self.fire(WatchKind::Data, path, WatchedEventKind::NodeDeleted);
        self.fire(WatchKind::Children, path, WatchedEventKind::NodeDeleted);
        if let Some(parent) = parent_path(path) {
            self.fire(WatchKind::Children, parent, WatchedEventKind::NodeChildrenChanged);
        }
        Ok(())
    }

    /// Remove a session, its ephemeral nodes and its watches
    fn end_session(&mut self, session_id: u64, final_state: SessionState) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();

        if let Some(entry) = self.sessions.remove(&session_id) {
            let _ = entry.tx.send(SessionNotification::State(final_state));
        }
        for watchers in self.data_watches.values_mut() {
            watchers.remove(&session_id);
        }
        for watchers in self.child_watches.values_mut() {
            watchers.remove(&session_id);
        }

        for path in owned {
            let _ = self.delete(&path);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WatchKind {
    Data,
    Children,
}

/// In-process coordination service shared by every simulated node
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EnsembleState::new())),
        }
    }

    /// Ids of all live sessions
    pub fn session_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Transiently disconnect a session; it keeps its nodes and watches
    pub fn disconnect(&self, session_id: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.sessions.get_mut(&session_id) {
            if entry.connected {
                info!(session_id, "Disconnecting coordination session");
                let _ = entry
                    .tx
                    .send(SessionNotification::State(SessionState::Disconnected));
                entry.connected = false;
            }
        }
    }

    /// Reconnect a disconnected session and flush held-back notifications
    pub fn reconnect(&self, session_id: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.sessions.get_mut(&session_id) {
            if !entry.connected {
                info!(session_id, "Reconnecting coordination session");
                entry.connected = true;
                let _ = entry
                    .tx
                    .send(SessionNotification::State(SessionState::Connected));
                for notification in entry.pending.drain(..) {
                    let _ = entry.tx.send(notification);
                }
            }
        }
    }

    /// Expire a session: its ephemeral nodes and watches are removed
    pub fn expire(&self, session_id: u64) {
        info!(session_id, "Expiring coordination session");
        self.state
            .lock()
            .end_session(session_id, SessionState::Expired);
    }

    /// Whether a node exists, bypassing sessions
    pub fn node_exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    /// Child names of a node, bypassing sessions
    pub fn children(&self, path: &str) -> Vec<String> {
        self.state.lock().children_of(path)
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationService for MemoryEnsemble {
    async fn connect(&self) -> Result<SessionHandle, CoordinationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = {
            let mut state = self.state.lock();
            let id = state.next_session_id;
            state.next_session_id += 1;
            state.sessions.insert(
                id,
                SessionEntry {
                    tx,
                    connected: true,
                    pending: Vec::new(),
                },
            );
            id
        };

        debug!(session_id, "Opened coordination session");
        Ok(SessionHandle {
            session: Arc::new(MemorySession {
                state: self.state.clone(),
                id: session_id,
            }),
            notifications: rx,
        })
    }
}

/// A session on a [`MemoryEnsemble`]
#[derive(Debug)]
pub struct MemorySession {
    state: Arc<Mutex<EnsembleState>>,
    id: u64,
}

#[async_trait]
impl CoordinationSession for MemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        let mut state = self.state.lock();
        state.check_session(self.id)?;
        state.create(self.id, path, data, mode)
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<Vec<u8>, CoordinationError> {
        let mut state = self.state.lock();
        state.check_session(self.id)?;
        let data = state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        if watch {
            state
                .data_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.id);
        }
        Ok(data)
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError> {
        let mut state = self.state.lock();
        state.check_session(self.id)?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        node.data = data;
        state.fire(WatchKind::Data, path, WatchedEventKind::NodeDataChanged);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        let mut state = self.state.lock();
        state.check_session(self.id)?;
        state.delete(path)
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<bool, CoordinationError> {
        let mut state = self.state.lock();
        state.check_session(self.id)?;
        if watch {
            state
                .data_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.id);
        }
        Ok(state.nodes.contains_key(path))
    }

    async fn get_children(
        &self,
        path: &str,
        watch: bool,
    ) -> Result<Vec<String>, CoordinationError> {
        let mut state = self.state.lock();
        state.check_session(self.id)?;
        if !state.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        if watch {
            state
                .child_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.id);
        }
        Ok(state.children_of(path))
    }

    async fn close(&self) {
        debug!(session_id = self.id, "Closing coordination session");
        self.state.lock().end_session(self.id, SessionState::Closed);
    }
}
