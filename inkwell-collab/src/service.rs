//! Collaboration service: routes participant requests to sessions and
//! drives persistence.
//!
//! ```text
//!  transport ──► CollabService ──► SessionRegistry ──► DocumentSession (mutex)
//!                     │                                     │
//!                     │ spawn (detached)                    │ PersistRequest
//!                     ▼                                     ▼
//!               persist task ──spawn_blocking──► DocumentStore::save
//! ```
//!
//! Saves never run under a session lock. At most one save per session is in
//! flight; a failed save is logged and retried by the session's periodic
//! persist cycle.

use std::sync::Arc;

use inkwell_ot::Operation;

use crate::channel::ParticipantChannel;
use crate::presence::{CursorPosition, SelectionRange};
use crate::protocol::{ConnectionId, DocumentId, UserInfo};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::{
    AfterPersist, AppliedOperation, DocumentSession, LeaveOutcome, PersistRequest, SessionConfig,
    SessionError, SessionSnapshot,
};
use crate::store::{DocumentStore, StoreError};

#[derive(Clone)]
pub struct CollabService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    registry: SessionRegistry,
    store: Arc<dyn DocumentStore>,
    channel: Arc<dyn ParticipantChannel>,
    config: SessionConfig,
}

impl CollabService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        channel: Arc<dyn ParticipantChannel>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                registry: SessionRegistry::new(),
                store,
                channel,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Join a document, loading it on first use.
    pub async fn join(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
        user: UserInfo,
    ) -> Result<SessionSnapshot, SessionError> {
        loop {
            let (handle, created) = self
                .inner
                .registry
                .get_or_create(document_id, || self.load_session(document_id.clone()))
                .await?;
            if created {
                self.spawn_persist_cycle(handle.clone());
            }

            let result = handle.lock().await.join(connection_id, user.clone());
            match result {
                // Lost a race with the session closing: replace it.
                Err(SessionError::SessionClosed) => {
                    self.inner.registry.remove(document_id, &handle).await;
                }
                other => return other,
            }
        }
    }

    pub async fn leave(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
    ) -> Result<(), SessionError> {
        let handle = self.session(document_id, connection_id).await?;
        let outcome = handle.lock().await.leave(connection_id)?;
        match outcome {
            LeaveOutcome::Drain(request) => self.spawn_persist(handle, request),
            LeaveOutcome::Closed => {
                self.inner.registry.remove(document_id, &handle).await;
            }
            LeaveOutcome::Remaining(_) | LeaveOutcome::Draining => {}
        }
        Ok(())
    }

    pub async fn apply_operation(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
        operation: Operation,
        base_version: i64,
    ) -> Result<AppliedOperation, SessionError> {
        let handle = self.session(document_id, connection_id).await?;
        let (applied, request) = {
            let mut session = handle.lock().await;
            let applied = session.apply_client_operation(connection_id, operation, base_version)?;
            let request = if session.persist_due() {
                session.take_persist_request()
            } else {
                None
            };
            (applied, request)
        };
        if let Some(request) = request {
            self.spawn_persist(handle, request);
        }
        Ok(applied)
    }

    pub async fn update_cursor(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
        position: CursorPosition,
    ) -> Result<(), SessionError> {
        let handle = self.session(document_id, connection_id).await?;
        let mut session = handle.lock().await;
        session.update_cursor(connection_id, position)
    }

    pub async fn update_selection(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
        range: SelectionRange,
    ) -> Result<(), SessionError> {
        let handle = self.session(document_id, connection_id).await?;
        let mut session = handle.lock().await;
        session.update_selection(connection_id, range)
    }

    /// Save every session with unsaved content and wait for the saves.
    ///
    /// Returns the number of sessions saved.
    pub async fn flush_all(&self) -> usize {
        let mut saved = 0;
        for handle in self.inner.registry.handles().await {
            let request = handle.lock().await.take_persist_request();
            if let Some(request) = request {
                if self.persist(handle, request).await {
                    saved += 1;
                }
            }
        }
        saved
    }

    async fn session(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
    ) -> Result<SessionHandle, SessionError> {
        self.inner
            .registry
            .get(document_id)
            .await
            .ok_or(SessionError::UnknownParticipant(connection_id))
    }

    async fn load_session(&self, document_id: DocumentId) -> Result<DocumentSession, SessionError> {
        let store = self.inner.store.clone();
        let id = document_id.clone();
        let stored = tokio::task::spawn_blocking(move || store.load(&id))
            .await
            .map_err(StoreError::from)??;

        match &stored {
            Some(doc) => log::info!("Loaded {document_id} at v{} from store", doc.version),
            None => log::info!("New document {document_id}"),
        }
        Ok(DocumentSession::new(
            document_id,
            stored,
            self.inner.config.clone(),
            self.inner.channel.clone(),
        ))
    }

    fn spawn_persist(&self, handle: SessionHandle, request: PersistRequest) {
        let service = self.clone();
        tokio::spawn(async move {
            service.persist(handle, request).await;
        });
    }

    /// Save `request`, then report back to the session. Repeats while a
    /// draining session still has newer content.
    async fn persist(&self, handle: SessionHandle, mut request: PersistRequest) -> bool {
        loop {
            let store = self.inner.store.clone();
            let PersistRequest {
                document_id,
                content,
                version,
            } = request;
            let id = document_id.clone();
            let result = tokio::task::spawn_blocking(move || store.save(&id, &content, version))
                .await
                .map_err(StoreError::from)
                .and_then(|saved| saved);

            let mut session = handle.lock().await;
            match result {
                Ok(metadata) => match session.mark_persisted(version, metadata) {
                    AfterPersist::Idle => return true,
                    AfterPersist::Again(next) => request = next,
                    AfterPersist::Closed => {
                        drop(session);
                        self.inner.registry.remove(&document_id, &handle).await;
                        return true;
                    }
                },
                Err(e) => {
                    session.persist_failed();
                    log::error!("Failed to save {document_id} at v{version}: {e}");
                    return false;
                }
            }
        }
    }

    /// Periodic save of unsaved content, until the session closes.
    fn spawn_persist_cycle(&self, handle: SessionHandle) {
        let service = self.clone();
        let period = self.inner.config.persist_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let request = {
                    let mut session = handle.lock().await;
                    if session.is_closed() {
                        break;
                    }
                    session.take_persist_request()
                };
                if let Some(request) = request {
                    service.persist(handle.clone(), request).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHub;
    use crate::protocol::ServerEvent;
    use crate::store::{DocumentMetadata, MemoryStore, StoredDocument};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::{sleep, timeout, Duration};
    use uuid::Uuid;

    /// Store whose saves fail until switched on.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        healthy: AtomicBool,
    }

    impl DocumentStore for FlakyStore {
        fn load(&self, id: &DocumentId) -> Result<Option<StoredDocument>, StoreError> {
            self.inner.load(id)
        }

        fn save(&self, id: &DocumentId, content: &str, version: u64) -> Result<DocumentMetadata, StoreError> {
            if self.healthy.load(Ordering::SeqCst) {
                self.inner.save(id, content, version)
            } else {
                Err(StoreError::IoError("disk full".into()))
            }
        }

        fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
            self.inner.list_documents()
        }
    }

    fn service_with(store: Arc<dyn DocumentStore>) -> (CollabService, Arc<ChannelHub>) {
        service_with_config(store, SessionConfig::for_testing())
    }

    /// Periodic cycle effectively off, so only explicit saves happen.
    fn without_cycle() -> SessionConfig {
        SessionConfig {
            persist_interval: Duration::from_secs(3600),
            ..SessionConfig::for_testing()
        }
    }

    fn service_with_config(
        store: Arc<dyn DocumentStore>,
        config: SessionConfig,
    ) -> (CollabService, Arc<ChannelHub>) {
        let hub = Arc::new(ChannelHub::new(64));
        let service = CollabService::new(store, hub.clone(), config);
        (service, hub)
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(2), async {
            while !check().await {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_join_loads_stored_content() {
        let store = Arc::new(MemoryStore::new());
        store.insert(DocumentId::new("doc"), "stored text", 4);
        let (service, hub) = service_with(store);

        let conn = Uuid::new_v4();
        let _rx = hub.register(conn);
        let snapshot = service
            .join(&DocumentId::new("doc"), conn, UserInfo::new("u", "Ada"))
            .await
            .unwrap();
        assert_eq!(snapshot.content, "stored text");
        assert_eq!(snapshot.version, 4);
    }

    #[tokio::test]
    async fn test_last_leave_persists_and_closes() {
        let store = Arc::new(MemoryStore::new());
        let (service, hub) = service_with(store.clone());
        let doc = DocumentId::new("doc");

        let conn = Uuid::new_v4();
        let _rx = hub.register(conn);
        service.join(&doc, conn, UserInfo::new("u", "Ada")).await.unwrap();
        service.apply_operation(&doc, conn, Operation::insert(0, "draft"), 0).await.unwrap();
        service.leave(&doc, conn).await.unwrap();

        let svc = &service;
        wait_for(move || async move { svc.registry().session_count().await == 0 }).await;
        let saved = store.load(&doc).unwrap().unwrap();
        assert_eq!(saved.content, "draft");
        assert_eq!(saved.version, 1);

        // A later join starts a fresh session from the saved content.
        let again = Uuid::new_v4();
        let _rx2 = hub.register(again);
        let snapshot = service.join(&doc, again, UserInfo::new("u", "Ada")).await.unwrap();
        assert_eq!(snapshot.content, "draft");
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn test_persist_every_n_ops() {
        let store = Arc::new(MemoryStore::new());
        let (service, hub) = service_with_config(store.clone(), without_cycle());
        let doc = DocumentId::new("doc");
        let conn = Uuid::new_v4();
        let mut rx = hub.register(conn);
        service.join(&doc, conn, UserInfo::new("u", "Ada")).await.unwrap();

        for i in 0..5 {
            service
                .apply_operation(&doc, conn, Operation::insert(0, "x"), i)
                .await
                .unwrap();
        }

        let (st, id) = (&store, &doc);
        wait_for(move || async move { st.load(id).unwrap().is_some_and(|d| d.version == 5) }).await;

        let mut saw_saved = false;
        while let Ok(Some(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
            if let ServerEvent::Saved { version, .. } = *event {
                assert_eq!(version, 5);
                saw_saved = true;
                break;
            }
        }
        assert!(saw_saved);
    }

    #[tokio::test]
    async fn test_failed_save_retried_by_cycle() {
        let store = Arc::new(FlakyStore::default());
        let (service, hub) = service_with(store.clone());
        let doc = DocumentId::new("doc");
        let conn = Uuid::new_v4();
        let _rx = hub.register(conn);
        service.join(&doc, conn, UserInfo::new("u", "Ada")).await.unwrap();
        service.apply_operation(&doc, conn, Operation::insert(0, "kept"), 0).await.unwrap();

        // Edits keep working while the store is down.
        sleep(Duration::from_millis(120)).await;
        let applied = service
            .apply_operation(&doc, conn, Operation::insert(4, "!"), 1)
            .await
            .unwrap();
        assert_eq!(applied.version, 2);
        assert!(store.inner.load(&doc).unwrap().is_none());

        store.healthy.store(true, Ordering::SeqCst);
        let (st, id) = (&store, &doc);
        wait_for(move || async move {
            st.inner.load(id).unwrap().is_some_and(|d| d.content == "kept!")
        })
        .await;
    }

    #[tokio::test]
    async fn test_concurrent_joins_share_one_session() {
        let (service, hub) = service_with(Arc::new(MemoryStore::new()));
        let doc = DocumentId::new("doc");

        let mut tasks = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            let doc = doc.clone();
            let conn = Uuid::new_v4();
            let rx = hub.register(conn);
            tasks.push(tokio::spawn(async move {
                let _rx = rx;
                service
                    .join(&doc, conn, UserInfo::new(format!("u{i}"), format!("user {i}")))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(service.registry().session_count().await, 1);
        let handle = service.registry().get(&doc).await.unwrap();
        assert_eq!(handle.lock().await.participant_count(), 8);
    }

    #[tokio::test]
    async fn test_requests_for_unknown_document() {
        let (service, _hub) = service_with(Arc::new(MemoryStore::new()));
        let doc = DocumentId::new("nowhere");
        let conn = Uuid::new_v4();

        assert!(matches!(
            service.apply_operation(&doc, conn, Operation::insert(0, "x"), 0).await,
            Err(SessionError::UnknownParticipant(_))
        ));
        assert!(matches!(
            service.leave(&doc, conn).await,
            Err(SessionError::UnknownParticipant(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_all() {
        let store = Arc::new(MemoryStore::new());
        let (service, hub) = service_with_config(store.clone(), without_cycle());
        let conn = Uuid::new_v4();
        let _rx = hub.register(conn);

        for name in ["a", "b"] {
            let doc = DocumentId::new(name);
            service.join(&doc, conn, UserInfo::new("u", "Ada")).await.unwrap();
            service.apply_operation(&doc, conn, Operation::insert(0, name), 0).await.unwrap();
        }

        assert_eq!(service.flush_all().await, 2);
        assert_eq!(store.load(&DocumentId::new("b")).unwrap().unwrap().content, "b");
        assert_eq!(service.flush_all().await, 0);
    }
}
