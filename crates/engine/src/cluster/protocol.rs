//! Wire protocol between coordination clients and the coordination server
//!
//! Every message is one frame: a 4-byte big-endian length followed by a JSON
//! payload of that many bytes. The server speaks first with [`ServerMessage::Hello`],
//! then answers each [`Request`] with a [`ServerMessage::Reply`] carrying the
//! same id. Watch notifications and session state changes are pushed
//! unsolicited. A session that ends on the server ends its connection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::service::{CoordinationError, CreateMode, SessionState, WatchedEvent};

/// Maximum frame payload size (4 MiB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Errors reading or writing frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Empty frame")]
    Empty,

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A client request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: Operation,
}

/// Session operations, one per [`CoordinationSession`](super::CoordinationSession) method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Create {
        path: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        mode: CreateMode,
    },
    GetData {
        path: String,
        watch: bool,
    },
    SetData {
        path: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Delete {
        path: String,
    },
    Exists {
        path: String,
        watch: bool,
    },
    GetChildren {
        path: String,
        watch: bool,
    },
    Close,
}

/// Successful outcome of an [`Operation`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Created {
        path: String,
    },
    Data {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Exists {
        exists: bool,
    },
    Children {
        names: Vec<String>,
    },
    Done,
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on a connection: the session it is bound to
    Hello { session_id: u64 },
    Reply {
        id: u64,
        result: Result<Reply, CoordinationError>,
    },
    Watch { event: WatchedEvent },
    State { state: SessionState },
}

/// Write one frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
///
/// A clean end of stream before the length prefix is [`FrameError::ConnectionClosed`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WatchedEventKind;

    #[tokio::test]
    async fn test_frames_share_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let request = Request {
            id: 7,
            op: Operation::Create {
                path: "/certfleet/members/p1-".to_string(),
                data: vec![0, 159, 255],
                mode: CreateMode::EphemeralSequential,
            },
        };
        write_frame(&mut client, &request).await.unwrap();
        write_frame(&mut client, &Request { id: 8, op: Operation::Close })
            .await
            .unwrap();

        let first: Request = read_frame(&mut server).await.unwrap();
        let second: Request = read_frame(&mut server).await.unwrap();
        assert_eq!(first, request);
        assert_eq!(second.op, Operation::Close);
    }

    #[test]
    fn test_server_message_shape() {
        let watch = ServerMessage::Watch {
            event: WatchedEvent {
                kind: WatchedEventKind::NodeChildrenChanged,
                path: "/certfleet/members".to_string(),
            },
        };
        let json = serde_json::to_value(&watch).unwrap();
        assert_eq!(json["type"], "watch");
        assert_eq!(json["event"]["path"], "/certfleet/members");

        let failed = ServerMessage::Reply {
            id: 3,
            result: Err(CoordinationError::NoNode("/missing".to_string())),
        };
        let decoded: ServerMessage =
            serde_json::from_slice(&serde_json::to_vec(&failed).unwrap()).unwrap();
        assert_eq!(decoded, failed);
    }

    #[tokio::test]
    async fn test_end_of_stream_is_connection_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let result: Result<Request, _> = read_frame(&mut server).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes())
            .await
            .unwrap();
        let result: Result<Request, _> = read_frame(&mut server).await;
        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
    }
}
