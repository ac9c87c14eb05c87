//! Coordination service interface
//!
//! A hierarchical namespace of nodes with ephemeral and sequential variants,
//! one-shot watches and session state notifications. Sessions are explicit
//! objects: when one expires, the client connects a new one and re-registers
//! its ephemeral nodes and watches.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Width of the zero-padded counter appended to sequential nodes
pub const SEQUENCE_WIDTH: usize = 10;

/// Errors returned by coordination service operations
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CoordinationError {
    #[error("Node '{0}' does not exist")]
    NoNode(String),

    #[error("Node '{0}' already exists")]
    NodeExists(String),

    #[error("Node '{0}' has children")]
    NotEmpty(String),

    /// Session temporarily disconnected; may recover
    #[error("Connection to coordination service lost")]
    ConnectionLoss,

    /// Session is gone along with its ephemeral nodes and watches
    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Coordination session closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoordinationError {
    /// Whether retrying the same session can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoordinationError::ConnectionLoss)
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(e: serde_json::Error) -> Self {
        CoordinationError::Serialization(e.to_string())
    }
}

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    /// Removed when the creating session ends
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// What changed on a watched node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchedEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedEvent {
    pub kind: WatchedEventKind,
    pub path: String,
}

/// Session liveness as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

/// Notifications delivered on a session's channel, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotification {
    Watch(WatchedEvent),
    State(SessionState),
}

/// A connected session and its notification stream
pub struct SessionHandle {
    pub session: Arc<dyn CoordinationSession>,
    pub notifications: mpsc::UnboundedReceiver<SessionNotification>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session.session_id())
            .finish_non_exhaustive()
    }
}

/// Entry point to a coordination service
#[async_trait]
pub trait CoordinationService: Send + Sync + fmt::Debug {
    /// Open a new session
    async fn connect(&self) -> Result<SessionHandle, CoordinationError>;
}

/// Operations available on an open session
///
/// Watches are one-shot: a watch set by a read fires at most once, on the
/// session's notification channel.
#[async_trait]
pub trait CoordinationSession: Send + Sync + fmt::Debug {
    fn session_id(&self) -> u64;

    /// Create a node, returning its actual path (with sequence suffix if any)
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinationError>;

    /// Read a node's data, optionally watching it for change or deletion
    async fn get_data(&self, path: &str, watch: bool) -> Result<Vec<u8>, CoordinationError>;

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError>;

    async fn delete(&self, path: &str) -> Result<(), CoordinationError>;

    /// Whether a node exists, optionally watching for its creation or change
    async fn exists(&self, path: &str, watch: bool) -> Result<bool, CoordinationError>;

    /// Child names (not paths), optionally watching for membership changes
    async fn get_children(&self, path: &str, watch: bool)
        -> Result<Vec<String>, CoordinationError>;

    /// End the session, removing its ephemeral nodes
    async fn close(&self);

    /// Create a persistent node and any missing parents
    async fn ensure_path(&self, path: &str) -> Result<(), CoordinationError> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.create(&current, Vec::new(), CreateMode::Persistent).await {
                Ok(_) | Err(CoordinationError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Join a parent path and a child name
pub fn child_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of a path, `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(pos) => Some(&trimmed[..pos]),
    }
}

/// Sequence number of a sequential node name
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_WIDTH {
        return None;
    }
    name[name.len() - SEQUENCE_WIDTH..].parse().ok()
}
