//! # inkwell-collab — Server-authoritative collaborative editing
//!
//! Sessions apply participants' operations in one authoritative order,
//! transforming late arrivals past everything they missed, and broadcast the
//! result so every replica converges.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄────────────────► │ CollabServer │
//! │ (Replica)   │  bincode / JSON    │              │
//! └─────────────┘                    └──────┬───────┘
//!                                           │
//!                                    ┌──────┴────────┐
//!                                    │ CollabService │──► DocumentStore
//!                                    └──────┬────────┘    (RocksDB / memory)
//!                                           │
//!                                  ┌────────┴────────┐
//!                                  │ SessionRegistry │
//!                                  └────────┬────────┘
//!                                           │ one mutex per document
//!                                  ┌────────┴────────┐
//!                                  │ DocumentSession │──► ParticipantChannel
//!                                  └─────────────────┘    (ChannelHub)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire messages (bincode binary frames, JSON text frames)
//! - [`presence`] — Participants, cursors and selections
//! - [`session`] — Per-document state machine and transform pipeline
//! - [`registry`] — Document id → session, created once per cold document
//! - [`channel`] — Outbound delivery interface and its in-process hub
//! - [`service`] — Request routing and persistence scheduling
//! - [`store`] — Document stores
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket sync client

pub mod protocol;
pub mod presence;
pub mod session;
pub mod registry;
pub mod channel;
pub mod service;
pub mod store;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, ConnectionId, DocumentId, ProtocolError, ServerEvent, UserInfo, WireFormat,
};
pub use presence::{CursorPosition, ParticipantInfo, SelectionRange};
pub use session::{
    AppliedOperation, DocumentSession, SessionConfig, SessionError, SessionSnapshot, SessionStatus,
};
pub use registry::{SessionHandle, SessionRegistry};
pub use channel::{ChannelHub, ChannelStats, ParticipantChannel};
pub use service::CollabService;
pub use store::{
    DocumentMetadata, DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError,
    StoredDocument,
};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use client::{ClientEvent, ConnectionState, Replica, SyncClient};
