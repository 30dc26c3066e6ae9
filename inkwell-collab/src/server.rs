//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── DocumentSession (doc 1)
//!             ├── connection task ──► CollabService
//! Client B ──┘        ▲                 └── DocumentSession (doc 2)
//!                     │                          │
//!                     └──── ChannelHub ◄─────────┘  (per-connection queue)
//!                                                │
//!                                         DocumentStore (RocksDB / memory)
//! ```
//!
//! Each connection task reads frames in order, so a participant's
//! operations are processed before its disconnect is. Outbound events for
//! the connection arrive on its hub queue and are written in the framing of
//! the first frame the client sent.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::channel::{ChannelHub, ParticipantChannel};
use crate::protocol::{ClientMessage, ConnectionId, DocumentId, ProtocolError, ServerEvent, WireFormat};
use crate::service::CollabService;
use crate::session::SessionConfig;
use crate::store::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
    /// WebSocket ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    /// Session tuning
    pub session: SessionConfig,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            session: SessionConfig::default(),
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            outbound_capacity: 64,
            heartbeat_interval_secs: 0,
            session: SessionConfig::for_testing(),
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_messages: AtomicU64,
}

/// Per-connection state owned by the connection task.
///
/// Registered with the hub on creation. Dropping it deregisters the
/// connection and leaves any document still joined, so a connection task
/// that unwinds mid-request does not strand its participants.
struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    format: Option<WireFormat>,
    /// Documents joined on this connection, in join order
    documents: Vec<DocumentId>,
    service: CollabService,
    hub: Arc<ChannelHub>,
    stats: Arc<AtomicServerStats>,
}

impl Connection {
    fn open(
        addr: SocketAddr,
        service: CollabService,
        hub: Arc<ChannelHub>,
        stats: Arc<AtomicServerStats>,
    ) -> (Self, mpsc::Receiver<Arc<ServerEvent>>) {
        let id = Uuid::new_v4();
        let outbound = hub.register(id);
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        let conn = Self {
            id,
            addr,
            format: None,
            documents: Vec::new(),
            service,
            hub,
            stats,
        };
        (conn, outbound)
    }

    /// Leave every joined document, in join order.
    async fn release(&mut self) {
        for document_id in std::mem::take(&mut self.documents) {
            if let Err(e) = self.service.leave(&document_id, self.id).await {
                log::debug!("Leave of {document_id} on disconnect: {e}");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let documents = std::mem::take(&mut self.documents);
        if !documents.is_empty() {
            log::warn!(
                "Connection {} dropped while joined to {} document(s)",
                self.id,
                documents.len()
            );
            let (id, service) = (self.id, self.service.clone());
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        for document_id in documents {
                            if let Err(e) = service.leave(&document_id, id).await {
                                log::debug!("Leave of {document_id} on drop: {e}");
                            }
                        }
                    });
                }
                Err(_) => log::error!("No runtime to release connection {id}"),
            }
        }
        self.hub.deregister(self.id);
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct CollabServer {
    config: ServerConfig,
    service: CollabService,
    hub: Arc<ChannelHub>,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    /// Create a server, opening RocksDB storage if a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let hub = Arc::new(ChannelHub::new(config.outbound_capacity));
        let service = CollabService::new(store, hub.clone(), config.session.clone());
        Self {
            config,
            service,
            hub,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let heartbeat = self.config.heartbeat_interval_secs;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service, hub, stats, heartbeat).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: CollabService,
        hub: Arc<ChannelHub>,
        stats: Arc<AtomicServerStats>,
        heartbeat_secs: u64,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (mut conn, mut outbound) = Connection::open(addr, service.clone(), hub.clone(), stats.clone());
        log::info!("WebSocket connection {} established from {addr}", conn.id);

        let mut heartbeat = tokio::time::interval(Duration::from_secs(heartbeat_secs.max(1)));
        heartbeat.tick().await;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                conn.format.get_or_insert(WireFormat::Binary);
                                stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                                Self::dispatch(&service, &hub, &stats, &mut conn, ClientMessage::decode(&data)).await;
                            }
                            Some(Ok(Message::Text(text))) => {
                                conn.format.get_or_insert(WireFormat::Json);
                                stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);
                                Self::dispatch(&service, &hub, &stats, &mut conn, ClientMessage::from_json(text.as_str())).await;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {} closed from {}", conn.id, conn.addr);
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {}: {e}", conn.addr);
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }

                    // Outgoing event for this connection
                    event = outbound.recv() => {
                        match event {
                            Some(event) => {
                                let frame = encode_event(&event, conn.format.unwrap_or(WireFormat::Binary))?;
                                ws_sender.send(frame).await?;
                            }
                            None => break,
                        }
                    }

                    _ = heartbeat.tick(), if heartbeat_secs > 0 => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        conn.release().await;
        result
    }

    /// Route one decoded client message. Failures become a `Rejected`
    /// event for this connection only.
    async fn dispatch(
        service: &CollabService,
        hub: &ChannelHub,
        stats: &AtomicServerStats,
        conn: &mut Connection,
        decoded: Result<ClientMessage, ProtocolError>,
    ) {
        stats.total_messages.fetch_add(1, Ordering::Relaxed);

        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode message from {}: {e}", conn.addr);
                Self::reject(hub, stats, conn.id, None, e.to_string(), None);
                return;
            }
        };
        let document_id = msg.document_id().cloned();

        let result = match msg {
            ClientMessage::Join { document_id, user } => {
                service.join(&document_id, conn.id, user).await.map(|_| {
                    if !conn.documents.contains(&document_id) {
                        conn.documents.push(document_id);
                    }
                })
            }
            ClientMessage::Operation {
                document_id,
                operation,
                base_version,
            } => service
                .apply_operation(&document_id, conn.id, operation, base_version)
                .await
                .map(|_| ()),
            ClientMessage::Cursor {
                document_id,
                position,
            } => service.update_cursor(&document_id, conn.id, position).await,
            ClientMessage::Selection { document_id, range } => {
                service.update_selection(&document_id, conn.id, range).await
            }
            ClientMessage::Leave { document_id } => {
                conn.documents.retain(|d| *d != document_id);
                service.leave(&document_id, conn.id).await
            }
            ClientMessage::Ping => {
                hub.send_to(conn.id, Arc::new(ServerEvent::Pong));
                Ok(())
            }
        };

        if let Err(e) = result {
            log::warn!("Rejected request from {} on {document_id:?}: {e}", conn.id);
            let current_version = e.current_version();
            Self::reject(hub, stats, conn.id, document_id, e.to_string(), current_version);
        }
    }

    fn reject(
        hub: &ChannelHub,
        stats: &AtomicServerStats,
        connection_id: ConnectionId,
        document_id: Option<DocumentId>,
        reason: String,
        current_version: Option<u64>,
    ) {
        stats.rejected_messages.fetch_add(1, Ordering::Relaxed);
        hub.send_to(
            connection_id,
            Arc::new(ServerEvent::Rejected {
                document_id,
                reason,
                current_version,
            }),
        );
    }

    /// Save every session with unsaved content.
    pub async fn flush(&self) -> usize {
        self.service.flush_all().await
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            rejected_messages: self.stats.rejected_messages.load(Ordering::Relaxed),
            active_sessions: self.service.registry().session_count().await,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn service(&self) -> &CollabService {
        &self.service
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }
}

fn encode_event(event: &ServerEvent, format: WireFormat) -> Result<Message, ProtocolError> {
    Ok(match format {
        WireFormat::Binary => Message::Binary(event.encode()?.into()),
        WireFormat::Json => Message::Text(event.to_json()?.into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UserInfo;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.hub().capacity(), 256);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        let server = CollabServer::new(config).unwrap();
        assert!(server.service().store().list_documents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = CollabServer::with_store(ServerConfig::for_testing(), Arc::new(MemoryStore::new()));
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.rejected_messages, 0);
        assert_eq!(stats.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_connection_released_when_task_panics() {
        let server = CollabServer::with_store(ServerConfig::for_testing(), Arc::new(MemoryStore::new()));
        let doc = DocumentId::new("doc");
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let observer = Uuid::new_v4();
        let mut observer_rx = server.hub.register(observer);
        server
            .service
            .join(&doc, observer, UserInfo::new("obs", "Observer"))
            .await
            .unwrap();

        let (mut conn, _outbound) =
            Connection::open(addr, server.service.clone(), server.hub.clone(), server.stats.clone());
        let id = conn.id;
        server.service.join(&doc, id, UserInfo::new("u1", "Alice")).await.unwrap();
        conn.documents.push(doc.clone());
        assert_eq!(server.stats().await.active_connections, 1);

        let task = tokio::spawn(async move {
            let _conn = conn;
            panic!("request handler failed");
        });
        assert!(task.await.unwrap_err().is_panic());

        assert!(!server.hub.is_registered(id));
        assert_eq!(server.stats().await.active_connections, 0);

        let left = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match observer_rx.recv().await.as_deref() {
                    Some(ServerEvent::ParticipantLeft { connection_id, .. }) => return *connection_id,
                    Some(_) => continue,
                    None => panic!("observer queue closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(left, id);

        let handle = server.service.registry().get(&doc).await.unwrap();
        assert_eq!(handle.lock().await.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_release_leaves_in_join_order() {
        let server = CollabServer::with_store(ServerConfig::for_testing(), Arc::new(MemoryStore::new()));
        let addr: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let (mut conn, _outbound) =
            Connection::open(addr, server.service.clone(), server.hub.clone(), server.stats.clone());
        for name in ["a", "b"] {
            let doc = DocumentId::new(name);
            server.service.join(&doc, conn.id, UserInfo::new("u1", "Alice")).await.unwrap();
            conn.documents.push(doc);
        }

        conn.release().await;
        assert!(conn.documents.is_empty());
        assert_eq!(server.service.registry().session_count().await, 0);
        drop(conn);
        assert_eq!(server.stats().await.active_connections, 0);
    }

    #[test]
    fn test_encode_event_framing() {
        let event = ServerEvent::Saved {
            document_id: DocumentId::new("doc"),
            version: 3,
        };
        match encode_event(&event, WireFormat::Json).unwrap() {
            Message::Text(text) => assert!(text.as_str().contains("\"saved\"")),
            other => panic!("Expected text frame, got {other:?}"),
        }
        match encode_event(&event, WireFormat::Binary).unwrap() {
            Message::Binary(data) => assert_eq!(ServerEvent::decode(&data).unwrap(), event),
            other => panic!("Expected binary frame, got {other:?}"),
        }
    }
}
