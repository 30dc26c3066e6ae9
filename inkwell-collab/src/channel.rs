//! Participant channel adapter: outbound delivery to connections.
//!
//! Sessions never touch sockets. They hand events to a [`ParticipantChannel`],
//! which routes them to one connection or fans them out to a document room.
//!
//! ```text
//! DocumentSession ──send_to / broadcast──► ChannelHub
//!                                            │  rooms: doc → [conn, …]
//!                                            │  connections: conn → mpsc
//!                                 ┌──────────┼──────────┐
//!                                 ▼          ▼          ▼
//!                              conn A     conn B     conn C   (writer tasks)
//! ```
//!
//! Every connection has exactly one bounded queue, so a direct reply and a
//! broadcast to the same connection are delivered in the order they were
//! issued. Delivery never blocks: a full queue drops the event and counts it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

use crate::protocol::{ConnectionId, DocumentId, ServerEvent};

/// Outbound side of the transport, as seen by a session.
///
/// Implementations must not block: sessions call these while holding their
/// mutation lock.
pub trait ParticipantChannel: Send + Sync {
    /// Deliver to one connection. Returns `false` if it could not be queued.
    fn send_to(&self, connection_id: ConnectionId, event: Arc<ServerEvent>) -> bool;

    /// Deliver to every member of the document room except `excluding`.
    /// Returns the number of connections the event was queued for.
    fn broadcast(
        &self,
        document_id: &DocumentId,
        event: Arc<ServerEvent>,
        excluding: Option<ConnectionId>,
    ) -> usize;

    /// Add a connection to a document room.
    fn subscribe(&self, document_id: &DocumentId, connection_id: ConnectionId);

    /// Remove a connection from a document room.
    fn unsubscribe(&self, document_id: &DocumentId, connection_id: ConnectionId);
}

/// Delivery statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub connections: usize,
    pub rooms: usize,
}

/// Lock-free counters on the delivery path.
#[derive(Default)]
struct AtomicChannelStats {
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

/// In-process channel adapter backed by per-connection mpsc queues.
pub struct ChannelHub {
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<Arc<ServerEvent>>>>,
    /// Room members in join order
    rooms: RwLock<HashMap<DocumentId, Vec<ConnectionId>>>,
    capacity: usize,
    stats: AtomicChannelStats,
}

impl ChannelHub {
    /// `capacity` bounds each connection's outbound queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicChannelStats::default(),
        }
    }

    /// Register a connection and return the receiving end of its queue.
    ///
    /// Registering an id twice replaces the previous queue.
    pub fn register(&self, connection_id: ConnectionId) -> mpsc::Receiver<Arc<ServerEvent>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id, tx);
        rx
    }

    /// Drop a connection's queue and its room memberships.
    pub fn deregister(&self, connection_id: ConnectionId) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection_id);

        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        rooms.retain(|_, members| {
            members.retain(|c| *c != connection_id);
            !members.is_empty()
        });
    }

    pub fn is_registered(&self, connection_id: ConnectionId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&connection_id)
    }

    /// Room members in join order.
    pub fn members(&self, document_id: &DocumentId) -> Vec<ConnectionId> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            connections: self
                .connections
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            rooms: self.rooms.read().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    fn deliver(
        &self,
        connection_id: ConnectionId,
        sender: &mpsc::Sender<Arc<ServerEvent>>,
        event: Arc<ServerEvent>,
    ) -> bool {
        match sender.try_send(event) {
            Ok(()) => {
                self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Connection {connection_id} lagging, dropped {} event",
                    event.name()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Connection {connection_id} closed before delivery");
                false
            }
        }
    }
}

impl ParticipantChannel for ChannelHub {
    fn send_to(&self, connection_id: ConnectionId, event: Arc<ServerEvent>) -> bool {
        let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
        match connections.get(&connection_id) {
            Some(sender) => self.deliver(connection_id, sender, event),
            None => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn broadcast(
        &self,
        document_id: &DocumentId,
        event: Arc<ServerEvent>,
        excluding: Option<ConnectionId>,
    ) -> usize {
        let members = self.members(document_id);
        let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        for connection_id in members {
            if Some(connection_id) == excluding {
                continue;
            }
            if let Some(sender) = connections.get(&connection_id) {
                if self.deliver(connection_id, sender, event.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn subscribe(&self, document_id: &DocumentId, connection_id: ConnectionId) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let members = rooms.entry(document_id.clone()).or_default();
        if !members.contains(&connection_id) {
            members.push(connection_id);
        }
    }

    fn unsubscribe(&self, document_id: &DocumentId, connection_id: ConnectionId) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(members) = rooms.get_mut(document_id) {
            members.retain(|c| *c != connection_id);
            if members.is_empty() {
                rooms.remove(document_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn doc() -> DocumentId {
        DocumentId::new("doc")
    }

    fn pong() -> Arc<ServerEvent> {
        Arc::new(ServerEvent::Pong)
    }

    #[tokio::test]
    async fn test_send_to_registered() {
        let hub = ChannelHub::new(8);
        let conn = Uuid::new_v4();
        let mut rx = hub.register(conn);

        assert!(hub.send_to(conn, pong()));
        assert_eq!(*rx.recv().await.unwrap(), ServerEvent::Pong);
        assert!(!hub.send_to(Uuid::new_v4(), pong()));
    }

    #[tokio::test]
    async fn test_broadcast_excluding() {
        let hub = ChannelHub::new(8);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let mut rx_a = hub.register(a);
        let mut rx_b = hub.register(b);
        let mut rx_c = hub.register(c);
        for conn in [a, b, c] {
            hub.subscribe(&doc(), conn);
        }

        assert_eq!(hub.broadcast(&doc(), pong(), Some(a)), 2);
        assert!(rx_b.recv().await.is_some());
        assert!(rx_c.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());

        assert_eq!(hub.broadcast(&doc(), pong(), None), 3);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let hub = ChannelHub::new(8);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let _rx_a = hub.register(a);
        let mut rx_b = hub.register(b);
        hub.subscribe(&doc(), a);
        hub.subscribe(&DocumentId::new("other"), b);

        assert_eq!(hub.broadcast(&doc(), pong(), None), 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let hub = ChannelHub::new(2);
        let conn = Uuid::new_v4();
        let _rx = hub.register(conn);

        assert!(hub.send_to(conn, pong()));
        assert!(hub.send_to(conn, pong()));
        assert!(!hub.send_to(conn, pong()));

        let stats = hub.stats();
        assert_eq!(stats.events_sent, 2);
        assert_eq!(stats.events_dropped, 1);
    }

    #[tokio::test]
    async fn test_reply_and_broadcast_keep_order() {
        let hub = ChannelHub::new(8);
        let conn = Uuid::new_v4();
        let mut rx = hub.register(conn);
        hub.subscribe(&doc(), conn);

        hub.send_to(conn, Arc::new(ServerEvent::Saved { document_id: doc(), version: 1 }));
        hub.broadcast(&doc(), pong(), None);

        assert_eq!(rx.recv().await.unwrap().name(), "saved");
        assert_eq!(rx.recv().await.unwrap().name(), "pong");
    }

    #[test]
    fn test_membership_join_order_and_cleanup() {
        let hub = ChannelHub::new(4);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            let _ = hub.register(*id);
            hub.subscribe(&doc(), *id);
        }
        hub.subscribe(&doc(), ids[0]);
        assert_eq!(hub.members(&doc()), ids);

        hub.unsubscribe(&doc(), ids[1]);
        assert_eq!(hub.members(&doc()), vec![ids[0], ids[2]]);

        hub.deregister(ids[0]);
        hub.deregister(ids[2]);
        assert!(hub.members(&doc()).is_empty());
        assert!(!hub.is_registered(ids[0]));
        assert_eq!(hub.stats().rooms, 0);
        assert_eq!(hub.stats().connections, 1);
    }
}
