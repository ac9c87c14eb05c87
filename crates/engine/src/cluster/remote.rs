//! Client for the networked coordination server
//!
//! A [`RemoteEnsemble`] holds the server list from the cluster connect string.
//! Each [`connect`](CoordinationService::connect) opens one TCP connection,
//! which carries exactly one session. Losing the connection, or a request
//! running past the deadline, ends the session with
//! [`SessionState::Expired`] so that the owner opens a new one and
//! re-registers.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use certfleet_config::ClusterConfig;

use super::protocol::{read_frame, write_frame, FrameError, Operation, Reply, Request, ServerMessage};
use super::service::{
    CoordinationError, CoordinationService, CoordinationSession, CreateMode, SessionHandle,
    SessionNotification, SessionState,
};

type ReplySender = oneshot::Sender<Result<Reply, CoordinationError>>;

/// Coordination service reached over TCP
#[derive(Debug)]
pub struct RemoteEnsemble {
    servers: Vec<String>,
    request_timeout: Duration,
    /// Server to try first on the next connect
    next_server: AtomicUsize,
}

impl RemoteEnsemble {
    pub fn new<I, S>(servers: I, request_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            request_timeout,
            next_server: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(
            config.servers(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    async fn open(&self, server: &str) -> Result<SessionHandle, CoordinationError> {
        let stream = timeout(self.request_timeout, TcpStream::connect(server))
            .await
            .map_err(|_| CoordinationError::ConnectionLoss)?
            .map_err(|e| {
                debug!(server, error = %e, "Coordination server refused connection");
                CoordinationError::ConnectionLoss
            })?;
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();

        let hello = timeout(self.request_timeout, read_frame::<_, ServerMessage>(&mut reader))
            .await
            .map_err(|_| CoordinationError::ConnectionLoss)?
            .map_err(|e| {
                debug!(server, error = %e, "No greeting from coordination server");
                CoordinationError::ConnectionLoss
            })?;
        let ServerMessage::Hello { session_id } = hello else {
            warn!(server, "Coordination server did not start with a greeting");
            return Err(CoordinationError::ConnectionLoss);
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection {
            pending: DashMap::new(),
            notifications: tx,
            finished: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });
        let reader_task = tokio::spawn(read_loop(reader, connection.clone(), session_id));

        info!(server, session_id, "Opened remote coordination session");
        Ok(SessionHandle {
            session: Arc::new(RemoteSession {
                id: session_id,
                writer: tokio::sync::Mutex::new(Some(writer)),
                next_request: AtomicU64::new(1),
                request_timeout: self.request_timeout,
                connection,
                reader_task: Mutex::new(Some(reader_task)),
            }),
            notifications: rx,
        })
    }
}

#[async_trait]
impl CoordinationService for RemoteEnsemble {
    async fn connect(&self) -> Result<SessionHandle, CoordinationError> {
        let count = self.servers.len();
        let start = self.next_server.fetch_add(1, Ordering::Relaxed);
        for offset in 0..count {
            let server = &self.servers[(start + offset) % count];
            match self.open(server).await {
                Ok(handle) => return Ok(handle),
                Err(e) => warn!(server = %server, error = %e, "Coordination server unavailable"),
            }
        }
        Err(CoordinationError::ConnectionLoss)
    }
}

/// State shared by a session and its reader task
#[derive(Debug)]
struct Connection {
    pending: DashMap<u64, ReplySender>,
    notifications: mpsc::UnboundedSender<SessionNotification>,
    finished: AtomicBool,
    /// Set when the local side asked to close
    closing: AtomicBool,
}

impl Connection {
    fn ended_error(&self) -> CoordinationError {
        if self.closing.load(Ordering::SeqCst) {
            CoordinationError::Closed
        } else {
            CoordinationError::SessionExpired
        }
    }

    /// End the session once: fail outstanding requests and report the final state
    fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        let error = self.ended_error();
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(error.clone()));
            }
        }

        let state = if error == CoordinationError::Closed {
            SessionState::Closed
        } else {
            SessionState::Expired
        };
        let _ = self.notifications.send(SessionNotification::State(state));
    }
}

async fn read_loop(mut reader: OwnedReadHalf, connection: Arc<Connection>, session_id: u64) {
    loop {
        match read_frame::<_, ServerMessage>(&mut reader).await {
            Ok(ServerMessage::Reply { id, result }) => {
                if let Some((_, reply)) = connection.pending.remove(&id) {
                    let _ = reply.send(result);
                }
            }
            Ok(ServerMessage::Watch { event }) => {
                let _ = connection
                    .notifications
                    .send(SessionNotification::Watch(event));
            }
            Ok(ServerMessage::State { state }) => match state {
                SessionState::Connected | SessionState::Disconnected => {
                    let _ = connection
                        .notifications
                        .send(SessionNotification::State(state));
                }
                SessionState::Expired | SessionState::Closed => {
                    debug!(session_id, state = ?state, "Session ended by coordination server");
                    break;
                }
            },
            Ok(ServerMessage::Hello { .. }) => {
                warn!(session_id, "Ignoring repeated greeting from coordination server");
            }
            Err(FrameError::ConnectionClosed) => {
                debug!(session_id, "Coordination server closed the connection");
                break;
            }
            Err(e) => {
                warn!(session_id, error = %e, "Lost connection to coordination server");
                break;
            }
        }
    }
    connection.finish();
}

/// A session on a [`RemoteEnsemble`]
#[derive(Debug)]
pub struct RemoteSession {
    id: u64,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    next_request: AtomicU64,
    request_timeout: Duration,
    connection: Arc<Connection>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteSession {
    async fn request(&self, op: Operation) -> Result<Reply, CoordinationError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.connection.pending.insert(id, tx);
        if self.connection.finished.load(Ordering::SeqCst) {
            self.connection.pending.remove(&id);
            return Err(self.connection.ended_error());
        }

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => {
                    timeout(self.request_timeout, write_frame(writer, &Request { id, op })).await
                }
                None => {
                    self.connection.pending.remove(&id);
                    return Err(self.connection.ended_error());
                }
            }
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session_id = self.id, error = %e, "Failed to send coordination request");
                return Err(self.abandon(id).await);
            }
            Err(_) => {
                warn!(session_id = self.id, "Timed out sending coordination request");
                return Err(self.abandon(id).await);
            }
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.connection.ended_error()),
            Err(_) => {
                warn!(
                    session_id = self.id,
                    timeout = ?self.request_timeout,
                    "Coordination request timed out"
                );
                Err(self.abandon(id).await)
            }
        }
    }

    /// Give up on the connection after a failed request
    async fn abandon(&self, id: u64) -> CoordinationError {
        self.connection.pending.remove(&id);
        self.shutdown().await;
        self.connection.ended_error()
    }

    /// Drop the connection; the server closes the session when it sees it go
    async fn shutdown(&self) {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.writer.lock().await.take();
        self.connection.finish();
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}

fn unexpected(reply: Reply) -> CoordinationError {
    CoordinationError::Serialization(format!("Unexpected reply: {:?}", reply))
}

#[async_trait]
impl CoordinationSession for RemoteSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        let op = Operation::Create {
            path: path.to_string(),
            data,
            mode,
        };
        match self.request(op).await? {
            Reply::Created { path } => Ok(path),
            other => Err(unexpected(other)),
        }
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<Vec<u8>, CoordinationError> {
        let op = Operation::GetData {
            path: path.to_string(),
            watch,
        };
        match self.request(op).await? {
            Reply::Data { data } => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError> {
        let op = Operation::SetData {
            path: path.to_string(),
            data,
        };
        match self.request(op).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        let op = Operation::Delete {
            path: path.to_string(),
        };
        match self.request(op).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<bool, CoordinationError> {
        let op = Operation::Exists {
            path: path.to_string(),
            watch,
        };
        match self.request(op).await? {
            Reply::Exists { exists } => Ok(exists),
            other => Err(unexpected(other)),
        }
    }

    async fn get_children(
        &self,
        path: &str,
        watch: bool,
    ) -> Result<Vec<String>, CoordinationError> {
        let op = Operation::GetChildren {
            path: path.to_string(),
            watch,
        };
        match self.request(op).await? {
            Reply::Children { names } => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    async fn close(&self) {
        if self.connection.finished.load(Ordering::SeqCst) {
            return;
        }
        debug!(session_id = self.id, "Closing remote coordination session");
        self.connection.closing.store(true, Ordering::SeqCst);
        let _ = self.request(Operation::Close).await;
        self.shutdown().await;
    }
}
