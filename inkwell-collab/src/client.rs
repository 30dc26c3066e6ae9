//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - A [`Replica`] of the document advanced only by server broadcasts
//! - Operation submission against the replica's version
//! - Cursor/selection updates
//!
//! The client never applies its own edits optimistically: the server echoes
//! every accepted operation, transformed, to its originator too, and that
//! echo is what the replica applies.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use inkwell_ot::{apply_operation, Operation, OtError};

use crate::presence::{CursorPosition, ParticipantInfo, SelectionRange};
use crate::protocol::{ClientMessage, ConnectionId, DocumentId, ProtocolError, ServerEvent, UserInfo};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Replica (re)seeded from a server snapshot
    Synced {
        version: u64,
        participants: Vec<ParticipantInfo>,
    },
    /// Server-transformed operation applied to the replica
    Operation {
        operation: Operation,
        version: u64,
        user_id: String,
    },
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft(ConnectionId),
    Cursor {
        connection_id: ConnectionId,
        position: CursorPosition,
    },
    Selection {
        connection_id: ConnectionId,
        range: SelectionRange,
    },
    Saved(u64),
    /// A request from this client was refused
    Rejected {
        reason: String,
        current_version: Option<u64>,
    },
    Pong,
}

/// Outcome of feeding a server operation to a [`Replica`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaUpdate {
    Applied,
    /// Already seen; ignored
    Duplicate,
    /// A version was skipped; the replica must resync
    Gap,
}

/// Local copy of a document at a known server version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replica {
    content: String,
    version: u64,
}

impl Replica {
    pub fn new(content: impl Into<String>, version: u64) -> Self {
        Self {
            content: content.into(),
            version,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replace the replica with a server snapshot.
    pub fn reset(&mut self, content: String, version: u64) {
        self.content = content;
        self.version = version;
    }

    /// Apply the server operation that produced `version`.
    ///
    /// Operations must arrive in version order.
    pub fn apply(&mut self, operation: &Operation, version: u64) -> Result<ReplicaUpdate, OtError> {
        if version <= self.version {
            return Ok(ReplicaUpdate::Duplicate);
        }
        if version != self.version + 1 {
            return Ok(ReplicaUpdate::Gap);
        }
        self.content = apply_operation(&self.content, operation)?;
        self.version = version;
        Ok(ReplicaUpdate::Applied)
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the collaboration server for one
/// document.
pub struct SyncClient {
    user: UserInfo,

    /// Document we're editing
    document_id: DocumentId,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Server-confirmed document state
    replica: Arc<RwLock<Replica>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<ClientEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    pub fn new(user: UserInfo, document_id: DocumentId, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user,
            document_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replica: Arc::new(RwLock::new(Replica::default())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the document.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let encoded = match msg.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("Failed to encode {msg:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let join = ClientMessage::Join {
            document_id: self.document_id.clone(),
            user: self.user.clone(),
        };
        out_tx
            .send(join.clone())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        // Weak, so that dropping the client's sender closes the writer.
        let resync_tx = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let replica = self.replica.clone();
        let document_id = self.document_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Binary(data)) => match ServerEvent::decode(&data) {
                        Ok(event) => event,
                        Err(e) => {
                            log::warn!("Undecodable server frame: {e}");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };

                let client_event =
                    Self::handle_server_event(event, &document_id, &replica, &resync_tx, &join).await;
                if let Some(client_event) = client_event {
                    let _ = event_tx.send(client_event).await;
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn handle_server_event(
        event: ServerEvent,
        document_id: &DocumentId,
        replica: &RwLock<Replica>,
        resync_tx: &mpsc::WeakSender<ClientMessage>,
        join: &ClientMessage,
    ) -> Option<ClientEvent> {
        match event {
            ServerEvent::State {
                document_id: doc,
                content,
                version,
                participants,
                ..
            } if doc == *document_id => {
                replica.write().await.reset(content, version);
                Some(ClientEvent::Synced {
                    version,
                    participants,
                })
            }
            ServerEvent::Operation {
                document_id: doc,
                operation,
                version,
                user_id,
            } if doc == *document_id => {
                let update = replica.write().await.apply(&operation, version);
                match update {
                    Ok(ReplicaUpdate::Applied) => Some(ClientEvent::Operation {
                        operation,
                        version,
                        user_id,
                    }),
                    Ok(ReplicaUpdate::Duplicate) => None,
                    Ok(ReplicaUpdate::Gap) | Err(_) => {
                        log::warn!("Replica of {doc} out of sync at v{version}, resyncing");
                        if let Some(tx) = resync_tx.upgrade() {
                            let _ = tx.send(join.clone()).await;
                        }
                        None
                    }
                }
            }
            ServerEvent::ParticipantJoined {
                document_id: doc,
                participant,
            } if doc == *document_id => Some(ClientEvent::ParticipantJoined(participant)),
            ServerEvent::ParticipantLeft {
                document_id: doc,
                connection_id,
            } if doc == *document_id => Some(ClientEvent::ParticipantLeft(connection_id)),
            ServerEvent::Cursor {
                document_id: doc,
                connection_id,
                position,
            } if doc == *document_id => Some(ClientEvent::Cursor {
                connection_id,
                position,
            }),
            ServerEvent::Selection {
                document_id: doc,
                connection_id,
                range,
            } if doc == *document_id => Some(ClientEvent::Selection {
                connection_id,
                range,
            }),
            ServerEvent::Saved {
                document_id: doc,
                version,
            } if doc == *document_id => Some(ClientEvent::Saved(version)),
            ServerEvent::Rejected {
                reason,
                current_version,
                ..
            } => Some(ClientEvent::Rejected {
                reason,
                current_version,
            }),
            ServerEvent::Pong => Some(ClientEvent::Pong),
            _ => None,
        }
    }

    /// Submit an operation computed against the replica's current content.
    pub async fn submit(&self, operation: Operation) -> Result<(), ProtocolError> {
        let base_version = self.replica.read().await.version() as i64;
        self.send(ClientMessage::Operation {
            document_id: self.document_id.clone(),
            operation,
            base_version,
        })
        .await
    }

    /// Submit an operation against an explicit base version.
    pub async fn submit_at(&self, operation: Operation, base_version: i64) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Operation {
            document_id: self.document_id.clone(),
            operation,
            base_version,
        })
        .await
    }

    pub async fn update_cursor(&self, position: CursorPosition) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Cursor {
            document_id: self.document_id.clone(),
            position,
        })
        .await
    }

    pub async fn update_selection(&self, range: SelectionRange) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Selection {
            document_id: self.document_id.clone(),
            range,
        })
        .await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    /// Leave the document and close the connection.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        let result = self
            .send(ClientMessage::Leave {
                document_id: self.document_id.clone(),
            })
            .await;
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        result
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn content(&self) -> String {
        self.replica.read().await.content().to_string()
    }

    pub async fn version(&self) -> u64 {
        self.replica.read().await.version()
    }

    /// Wait until the replica reaches `version`. Returns `false` on timeout.
    pub async fn wait_for_version(&self, version: u64, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.version().await < version {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_applies_in_order() {
        let mut replica = Replica::default();
        assert_eq!(replica.apply(&Operation::insert(0, "Hello"), 1), Ok(ReplicaUpdate::Applied));
        assert_eq!(replica.apply(&Operation::insert(5, "World"), 2), Ok(ReplicaUpdate::Applied));
        assert_eq!(replica.content(), "HelloWorld");
        assert_eq!(replica.version(), 2);
    }

    #[test]
    fn test_replica_ignores_duplicates_and_detects_gaps() {
        let mut replica = Replica::new("abc", 3);
        assert_eq!(replica.apply(&Operation::insert(0, "x"), 3), Ok(ReplicaUpdate::Duplicate));
        assert_eq!(replica.apply(&Operation::insert(0, "x"), 5), Ok(ReplicaUpdate::Gap));
        assert_eq!(replica.content(), "abc");

        replica.reset("fresh".into(), 9);
        assert_eq!(replica.version(), 9);
        assert_eq!(replica.content(), "fresh");
    }

    #[test]
    fn test_replica_rejects_out_of_range() {
        let mut replica = Replica::new("ab", 0);
        assert!(replica.apply(&Operation::insert(7, "x"), 1).is_err());
        assert_eq!(replica.version(), 0);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let mut client = SyncClient::new(UserInfo::new("u1", "Alice"), DocumentId::new("doc"), "ws://127.0.0.1:1");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
        assert_eq!(client.version().await, 0);
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let client = SyncClient::new(UserInfo::new("u1", "Alice"), DocumentId::new("doc"), "ws://127.0.0.1:1");
        assert!(matches!(
            client.submit(Operation::insert(0, "x")).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is never a WebSocket server in the test environment.
        let mut client = SyncClient::new(UserInfo::new("u1", "Alice"), DocumentId::new("doc"), "ws://127.0.0.1:1");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
