//! Connection handles and the registry that owns them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::websocket::{Frame, OutboundMessage};

/// Handle for a single live connection.
///
/// Owned by the [`ConnectionRegistry`] for its lifetime; rooms hold the id
/// only. Sends are fire-and-forget: once the handle is closed, or if the
/// outbound buffer is full, the message is dropped.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<OutboundMessage>,
    alive: AtomicBool,
    closed: AtomicBool,
    close_notify: Notify,
    close_reason: OnceLock<String>,
    rooms: RwLock<HashSet<String>>,
}

impl ConnectionHandle {
    fn new(sender: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            sender,
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            close_reason: OnceLock::new(),
            rooms: RwLock::new(HashSet::new()),
        }
    }

    /// Send a named event with a payload. Silent no-op once the connection
    /// has closed.
    pub fn send(&self, event: impl Into<String>, payload: Value) {
        self.enqueue(OutboundMessage::Frame(Frame::new(event, payload)));
    }

    /// Queue an outbound message without blocking. Returns false if the
    /// message was dropped (connection closed or buffer full).
    pub(crate) fn enqueue(&self, message: OutboundMessage) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    "Outbound buffer full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn enqueue_ping(&self) -> bool {
        self.enqueue(OutboundMessage::Ping)
    }

    /// Request a graceful close: the send task flushes a close frame to the
    /// peer. Returns false if the close could not be queued.
    pub(crate) fn close_gracefully(&self, reason: &str) -> bool {
        let _ = self.close_reason.set(reason.to_string());
        self.enqueue(OutboundMessage::Close)
    }

    /// Forcibly terminate the connection, bypassing graceful close. Teardown
    /// is driven by the connection task observing [`Self::closed`].
    pub fn disconnect(&self) {
        self.disconnect_with_reason("forced disconnect");
    }

    pub fn disconnect_with_reason(&self, reason: &str) {
        let _ = self.close_reason.set(reason.to_string());
        self.close_notify.notify_one();
    }

    /// Resolves when a forced disconnect has been requested.
    pub async fn closed(&self) {
        self.close_notify.notified().await;
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.get().map(String::as_str)
    }

    /// Liveness flag driven by the heartbeat monitor. Any probe
    /// acknowledgment from the peer resets it to true.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Current room memberships.
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.read().unwrap().iter().cloned().collect()
    }

    pub fn is_member_of(&self, room: &str) -> bool {
        self.rooms.read().unwrap().contains(room)
    }

    pub(crate) fn track_room(&self, room: &str) {
        self.rooms.write().unwrap().insert(room.to_string());
    }

    pub(crate) fn untrack_room(&self, room: &str) -> bool {
        self.rooms.write().unwrap().remove(room)
    }

    pub(crate) fn take_rooms(&self) -> Vec<String> {
        self.rooms.write().unwrap().drain().collect()
    }
}

/// Holds every active connection keyed by its generated identifier.
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a new connection. The identifier is generated here, so
    /// collisions are a non-issue by construction.
    pub fn register(&self, sender: mpsc::Sender<OutboundMessage>) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle::new(sender));
        self.connections.insert(handle.id, handle.clone());
        tracing::debug!(connection_id = %handle.id, "Connection registered");
        handle
    }

    /// Remove a connection and mark it closed. Returns `None` if the id is
    /// already absent, which makes double-close races harmless and gives the
    /// caller an exactly-once teardown signal.
    pub fn unregister(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.connections.remove(&connection_id)?;
        handle.mark_closed();
        tracing::debug!(connection_id = %connection_id, "Connection unregistered");
        Some(handle)
    }

    pub fn get(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|h| h.clone())
    }

    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.connections.iter().map(|r| *r.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
