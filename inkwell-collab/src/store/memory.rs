//! In-memory document store for tests and ephemeral servers.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::{DocumentMetadata, DocumentStore, StoreError, StoredDocument};
use crate::protocol::DocumentId;

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentId, StoredDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document as if it had been saved at `version`.
    pub fn insert(&self, document_id: DocumentId, content: impl Into<String>, version: u64) {
        let content = content.into();
        let metadata = DocumentMetadata::new(document_id.clone()).saved(&content, version, 0);
        self.lock().insert(
            document_id,
            StoredDocument {
                content,
                version,
                metadata,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DocumentId, StoredDocument>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, document_id: &DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.lock().get(document_id).cloned())
    }

    fn save(
        &self,
        document_id: &DocumentId,
        content: &str,
        version: u64,
    ) -> Result<DocumentMetadata, StoreError> {
        let mut documents = self.lock();
        let previous = documents
            .get(document_id)
            .map(|d| d.metadata.clone())
            .unwrap_or_else(|| DocumentMetadata::new(document_id.clone()));
        let metadata = previous.saved(content, version, 0);
        documents.insert(
            document_id.clone(),
            StoredDocument {
                content: content.to_string(),
                version,
                metadata: metadata.clone(),
            },
        );
        Ok(metadata)
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        Ok(self.lock().keys().cloned().collect())
    }
}
