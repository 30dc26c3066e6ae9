//! Session registry: document id → live [`DocumentSession`].
//!
//! Sessions are created lazily on first join. Each registry slot holds a
//! once-cell, so concurrent first joins for a cold document run the loader
//! exactly once; the others wait for its result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};

use crate::protocol::DocumentId;
use crate::session::{DocumentSession, SessionError};

/// Shared handle to a session. The mutex serializes every mutation.
pub type SessionHandle = Arc<Mutex<DocumentSession>>;

type Slot = Arc<OnceCell<SessionHandle>>;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<DocumentId, Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live session for `document_id`, or create it with `loader`.
    ///
    /// The boolean is `true` for the caller whose loader created the session.
    /// A failed load removes the empty slot; the next caller retries.
    pub async fn get_or_create<F, Fut>(
        &self,
        document_id: &DocumentId,
        loader: F,
    ) -> Result<(SessionHandle, bool), SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DocumentSession, SessionError>>,
    {
        // Fast path: read lock
        let slot = {
            let sessions = self.sessions.read().await;
            sessions.get(document_id).cloned()
        };
        if let Some(handle) = slot.as_ref().and_then(|s| s.get()) {
            return Ok((handle.clone(), false));
        }

        // Slow path: write lock to claim a slot
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let mut sessions = self.sessions.write().await;
                sessions.entry(document_id.clone()).or_default().clone()
            }
        };

        let created = AtomicBool::new(false);
        let result = slot
            .get_or_try_init(|| async {
                created.store(true, Ordering::Relaxed);
                let session = loader().await?;
                log::info!("Session created for {document_id}");
                Ok::<_, SessionError>(Arc::new(Mutex::new(session)))
            })
            .await;

        match result {
            Ok(handle) => Ok((handle.clone(), created.load(Ordering::Relaxed))),
            Err(e) => {
                self.discard_empty_slot(document_id, &slot).await;
                Err(e)
            }
        }
    }

    /// Drop a slot whose load failed, unless another caller is still
    /// waiting on it.
    async fn discard_empty_slot(&self, document_id: &DocumentId, slot: &Slot) {
        let mut sessions = self.sessions.write().await;
        let unclaimed = sessions
            .get(document_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !slot.initialized());
        // The map and this caller hold the only references under the write lock
        if unclaimed && Arc::strong_count(slot) == 2 {
            sessions.remove(document_id);
        }
    }

    pub async fn get(&self, document_id: &DocumentId) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(document_id).and_then(|slot| slot.get()).cloned()
    }

    /// Remove `document_id` if it still maps to `handle`.
    ///
    /// A closed session never evicts the session that replaced it.
    pub async fn remove(&self, document_id: &DocumentId, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        let matches = sessions
            .get(document_id)
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if matches {
            sessions.remove(document_id);
            log::info!("Session removed for {document_id}");
        }
        matches
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.values().filter(|slot| slot.initialized()).count()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Handles of every live session.
    pub async fn handles(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.values().filter_map(|slot| slot.get().cloned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelHub, ParticipantChannel};
    use crate::session::SessionConfig;
    use crate::store::StoreError;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration};

    fn channel() -> Arc<dyn ParticipantChannel> {
        Arc::new(ChannelHub::new(8))
    }

    fn empty_session(id: &DocumentId) -> DocumentSession {
        DocumentSession::new(id.clone(), None, SessionConfig::for_testing(), channel())
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_session() {
        let registry = SessionRegistry::new();
        let id = DocumentId::new("doc");

        let (first, created) = registry
            .get_or_create(&id, || async { Ok(empty_session(&id)) })
            .await
            .unwrap();
        assert!(created);

        let (second, created) = registry
            .get_or_create(&id, || async { Ok(empty_session(&id)) })
            .await
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_joins_load_once() {
        let registry = Arc::new(SessionRegistry::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let id = DocumentId::new("cold");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let loads = loads.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .get_or_create(&id, || async {
                        loads.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(20)).await;
                        Ok(empty_session(&id))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut handles = Vec::new();
        let mut creators = 0;
        for task in tasks {
            let (handle, created) = task.await.unwrap();
            creators += usize::from(created);
            handles.push(handle);
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(creators, 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let registry = SessionRegistry::new();
        let id = DocumentId::new("flaky");

        let result = registry
            .get_or_create(&id, || async {
                Err(SessionError::Store(StoreError::IoError("disk gone".into())))
            })
            .await;
        assert!(matches!(result, Err(SessionError::Store(_))));
        assert_eq!(registry.session_count().await, 0);
        assert!(registry.get(&id).await.is_none());
        assert!(registry.sessions.read().await.is_empty());

        let (_, created) = registry
            .get_or_create(&id, || async { Ok(empty_session(&id)) })
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn test_failed_loads_leave_no_slots() {
        let registry = SessionRegistry::new();
        for i in 0..32 {
            let id = DocumentId::new(format!("missing-{i}"));
            let result = registry
                .get_or_create(&id, || async {
                    Err(SessionError::Store(StoreError::IoError("disk gone".into())))
                })
                .await;
            assert!(result.is_err());
        }
        assert!(registry.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_load_with_waiter_keeps_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let id = DocumentId::new("contended");

        let failing = {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move {
                registry
                    .get_or_create(&id, || async {
                        sleep(Duration::from_millis(30)).await;
                        Err(SessionError::Store(StoreError::IoError("disk gone".into())))
                    })
                    .await
                    .map(|_| ())
            })
        };
        sleep(Duration::from_millis(5)).await;
        let waiting = {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move {
                registry
                    .get_or_create(&id, || async { Ok(empty_session(&id)) })
                    .await
                    .unwrap()
            })
        };

        assert!(failing.await.unwrap().is_err());
        let (handle, created) = waiting.await.unwrap();
        assert!(created);

        let (again, created) = registry
            .get_or_create(&id, || async { Ok(empty_session(&id)) })
            .await
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&handle, &again));
        assert_eq!(registry.sessions.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_only_matching_handle() {
        let registry = SessionRegistry::new();
        let id = DocumentId::new("doc");

        let (old, _) = registry
            .get_or_create(&id, || async { Ok(empty_session(&id)) })
            .await
            .unwrap();
        assert!(registry.remove(&id, &old).await);
        assert_eq!(registry.session_count().await, 0);

        let (new, created) = registry
            .get_or_create(&id, || async { Ok(empty_session(&id)) })
            .await
            .unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&old, &new));

        // The stale handle cannot evict its replacement.
        assert!(!registry.remove(&id, &old).await);
        assert!(registry.get(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_active_documents() {
        let registry = SessionRegistry::new();
        for name in ["a", "b"] {
            let id = DocumentId::new(name);
            registry
                .get_or_create(&id, || async { Ok(empty_session(&id)) })
                .await
                .unwrap();
        }

        let mut docs = registry.active_documents().await;
        docs.sort();
        assert_eq!(docs, vec![DocumentId::new("a"), DocumentId::new("b")]);
        assert_eq!(registry.handles().await.len(), 2);
    }
}
