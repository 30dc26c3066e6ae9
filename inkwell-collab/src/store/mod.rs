//! Persistent storage for document content.
//!
//! ```text
//! ┌──────────────┐   load (cold join)    ┌────────────────┐
//! │ CollabService│ ────────────────────► │ DocumentStore  │
//! │              │ ◄──────────────────── │  MemoryStore   │
//! │              │   save (detached)     │  RocksStore    │
//! └──────────────┘                       └────────────────┘
//! ```
//!
//! Stores are synchronous; callers run them on the blocking pool so that a
//! slow disk never stalls a session's mutation path.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::protocol::DocumentId;

/// Content and version as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub content: String,
    pub version: u64,
    pub metadata: DocumentMetadata,
}

/// Bookkeeping stored alongside document content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: DocumentId,
    /// Version of the last saved content
    pub version: u64,
    /// Content length in characters
    pub content_chars: u64,
    /// Bytes on disk after compression (0 for in-memory stores)
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    pub fn new(document_id: DocumentId) -> Self {
        let now = unix_now();
        Self {
            document_id,
            version: 0,
            content_chars: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Metadata after saving `content` at `version`, keeping `created_at`.
    pub(crate) fn saved(&self, content: &str, version: u64, compressed_size: u64) -> Self {
        Self {
            document_id: self.document_id.clone(),
            version,
            content_chars: content.chars().count() as u64,
            compressed_size,
            created_at: self.created_at,
            updated_at: unix_now(),
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// External document store consumed by the session layer.
pub trait DocumentStore: Send + Sync {
    /// Load a document, `Ok(None)` if it has never been saved.
    fn load(&self, document_id: &DocumentId) -> Result<Option<StoredDocument>, StoreError>;

    /// Save content at `version`, returning the updated metadata.
    fn save(
        &self,
        document_id: &DocumentId,
        content: &str,
        version: u64,
    ) -> Result<DocumentMetadata, StoreError>;

    /// All documents that have been saved at least once.
    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// I/O error (including a failed blocking task)
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::IoError(e.to_string())
    }
}
