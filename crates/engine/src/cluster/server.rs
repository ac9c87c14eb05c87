//! Networked coordination server
//!
//! Serves a [`MemoryEnsemble`] over TCP so that engine processes on different
//! hosts share one namespace. Each connection is bound to exactly one session:
//! when the connection drops the session is closed and its ephemeral nodes go
//! with it, which is how peers notice a node leaving.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::memory::MemoryEnsemble;
use super::protocol::{
    read_frame, write_frame, FrameError, Operation, Reply, Request, ServerMessage,
};
use super::service::{
    CoordinationError, CoordinationService, CoordinationSession, SessionHandle,
    SessionNotification, SessionState,
};

/// TCP front end of a [`MemoryEnsemble`]
#[derive(Debug, Clone, Default)]
pub struct CoordinationServer {
    ensemble: MemoryEnsemble,
}

impl CoordinationServer {
    pub fn new(ensemble: MemoryEnsemble) -> Self {
        Self { ensemble }
    }

    /// The served ensemble
    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    /// Accept connections until `shutdown` flips to `true`
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        info!(address = %listener.local_addr()?, "Coordination server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept coordination connection");
                            continue;
                        }
                    };
                    let ensemble = self.ensemble.clone();
                    tokio::spawn(async move {
                        serve_connection(ensemble, stream, peer).await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Coordination server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn serve_connection(ensemble: MemoryEnsemble, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);

    let SessionHandle {
        session,
        mut notifications,
    } = match ensemble.connect().await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to open session for connection");
            return;
        }
    };
    let session_id = session.session_id();
    info!(
        peer = %peer,
        session_id,
        sessions = ensemble.session_ids().len(),
        "Coordination client connected"
    );

    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                debug!(session_id, error = %e, "Failed to write to coordination client");
                break;
            }
        }
    });

    let _ = tx.send(ServerMessage::Hello { session_id });

    // Ends when the session ends on the ensemble side
    let notify_tx = tx.clone();
    let mut forwarder = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            let (message, last) = match notification {
                SessionNotification::Watch(event) => (ServerMessage::Watch { event }, false),
                SessionNotification::State(state) => (
                    ServerMessage::State { state },
                    matches!(state, SessionState::Expired | SessionState::Closed),
                ),
            };
            if notify_tx.send(message).is_err() || last {
                break;
            }
        }
    });

    let mut session_ended = false;
    loop {
        tokio::select! {
            frame = read_frame::<_, Request>(&mut reader) => match frame {
                Ok(Request { id, op }) => {
                    let closing = op == Operation::Close;
                    trace!(session_id, id, op = ?op, "Coordination request");
                    let result = execute(session.as_ref(), op).await;
                    let _ = tx.send(ServerMessage::Reply { id, result });
                    if closing {
                        break;
                    }
                }
                Err(FrameError::ConnectionClosed) => break,
                Err(e) => {
                    warn!(session_id, error = %e, "Dropping coordination client");
                    break;
                }
            },
            _ = &mut forwarder => {
                debug!(session_id, "Session ended, closing connection");
                session_ended = true;
                break;
            }
        }
    }

    session.close().await;
    // Let the writer flush the final state change
    if !session_ended {
        let _ = forwarder.await;
    }
    drop(tx);
    let _ = writer_task.await;

    info!(
        peer = %peer,
        session_id,
        sessions = ensemble.session_ids().len(),
        "Coordination client disconnected"
    );
}

async fn execute(
    session: &dyn CoordinationSession,
    op: Operation,
) -> Result<Reply, CoordinationError> {
    match op {
        Operation::Create { path, data, mode } => session
            .create(&path, data, mode)
            .await
            .map(|path| Reply::Created { path }),
        Operation::GetData { path, watch } => session
            .get_data(&path, watch)
            .await
            .map(|data| Reply::Data { data }),
        Operation::SetData { path, data } => {
            session.set_data(&path, data).await.map(|_| Reply::Done)
        }
        Operation::Delete { path } => session.delete(&path).await.map(|_| Reply::Done),
        Operation::Exists { path, watch } => session
            .exists(&path, watch)
            .await
            .map(|exists| Reply::Exists { exists }),
        Operation::GetChildren { path, watch } => session
            .get_children(&path, watch)
            .await
            .map(|names| Reply::Children { names }),
        Operation::Close => {
            session.close().await;
            Ok(Reply::Done)
        }
    }
}
