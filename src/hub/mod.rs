//! The event hub: connection registry, room index and event dispatch.
//!
//! Transport tasks hand the hub newly established connections and decoded
//! frames; the hub owns everything from there: lifecycle events, room
//! membership and fan-out. All teardown paths converge on [`Hub::teardown`],
//! which runs at most once per connection.

mod registry;
mod rooms;

pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use rooms::RoomIndex;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::{lifecycle, EventDispatcher, Subscription};
use crate::websocket::{Frame, OutboundMessage};

/// Argument passed to server-side event handlers.
pub struct EventContext {
    pub connection: Arc<ConnectionHandle>,
    pub event: String,
    pub payload: Value,
}

impl EventContext {
    fn new(connection: Arc<ConnectionHandle>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            connection,
            event: event.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: HashMap<String, usize>,
}

pub struct Hub {
    registry: ConnectionRegistry,
    rooms: RoomIndex,
    dispatcher: EventDispatcher<EventContext>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            rooms: RoomIndex::new(),
            dispatcher: EventDispatcher::new(),
        }
    }

    /// Register a handler for a named event. Lifecycle names (`connection`,
    /// `disconnect`, `error`, `message`) are emitted by the hub itself; all
    /// other names fire on matching inbound frames.
    pub fn on(
        &self,
        event: impl Into<String>,
        handler: impl Fn(&EventContext) + Send + Sync + 'static,
    ) -> Subscription {
        self.dispatcher.on(event, handler)
    }

    pub fn off(&self, subscription: &Subscription) {
        self.dispatcher.off(subscription)
    }

    /// Accept a newly established connection: registers it and emits the
    /// `connection` lifecycle event.
    pub fn connect(&self, sender: mpsc::Sender<OutboundMessage>) -> Arc<ConnectionHandle> {
        let handle = self.registry.register(sender);
        tracing::info!(connection_id = %handle.id, "Connection established");
        let ctx = EventContext::new(handle.clone(), lifecycle::CONNECTION, Value::Null);
        self.dispatcher.emit(lifecycle::CONNECTION, &ctx);
        handle
    }

    /// Tear down a connection: unregister, sweep room memberships, emit
    /// `disconnect` with the closing reason. Safe to call from racing close
    /// paths; only the first call has any effect.
    pub fn teardown(&self, connection_id: Uuid, reason: &str) {
        let Some(handle) = self.registry.unregister(connection_id) else {
            return;
        };
        self.rooms.leave_all(&handle);

        let reason = handle.close_reason().unwrap_or(reason).to_string();
        tracing::info!(connection_id = %connection_id, reason = %reason, "Connection closed");

        let ctx = EventContext::new(
            handle.clone(),
            lifecycle::DISCONNECT,
            json!({ "reason": reason }),
        );
        self.dispatcher.emit(lifecycle::DISCONNECT, &ctx);
    }

    /// Route a decoded inbound frame: the named event fires first, then the
    /// generic `message` lifecycle event. Frames claiming a reserved
    /// lifecycle name are dropped.
    pub fn dispatch_frame(&self, handle: &Arc<ConnectionHandle>, frame: Frame) {
        if lifecycle::is_reserved(&frame.event) {
            tracing::debug!(
                connection_id = %handle.id,
                event = %frame.event,
                "Dropping inbound frame with reserved event name"
            );
            return;
        }

        let ctx = EventContext::new(handle.clone(), frame.event.clone(), frame.payload.clone());
        self.dispatcher.emit(&frame.event, &ctx);

        let message_ctx = EventContext::new(
            handle.clone(),
            lifecycle::MESSAGE,
            json!({ "event": frame.event, "payload": frame.payload }),
        );
        self.dispatcher.emit(lifecycle::MESSAGE, &message_ctx);
    }

    /// Surface a transport-level error via the `error` lifecycle event.
    /// Does not itself close the connection; closure is driven by the
    /// transport's own close notification.
    pub fn report_error(&self, handle: &Arc<ConnectionHandle>, detail: &str) {
        let ctx = EventContext::new(handle.clone(), lifecycle::ERROR, json!({ "detail": detail }));
        self.dispatcher.emit(lifecycle::ERROR, &ctx);
    }

    /// Add a connection to a room. A join racing with teardown cannot leave
    /// a dangling membership: the closed flag is checked after the insert,
    /// and a membership added behind the teardown sweep is discarded again.
    /// If the flag is still clear at that point, the sweep has not run yet
    /// and will pick the new membership up itself.
    pub fn join(&self, handle: &Arc<ConnectionHandle>, room: &str) {
        self.rooms.join(handle, room);
        if handle.is_closed() {
            self.rooms.discard(handle, room);
        }
    }

    pub fn leave(&self, handle: &Arc<ConnectionHandle>, room: &str) {
        self.rooms.leave(handle, room);
    }

    /// Send an event to every current member of a room. Pre-serializes the
    /// frame once and shares it across the fan-out. A room with no members
    /// is a silent no-op. Returns the number of members the frame was
    /// queued for.
    pub fn broadcast_room(&self, room: &str, event: impl Into<String>, payload: Value) -> usize {
        self.fan_out(&self.room_members(room), Frame::new(event, payload))
    }

    /// Send an event to every connection.
    pub fn broadcast(&self, event: impl Into<String>, payload: Value) -> usize {
        self.fan_out(&self.registry.all(), Frame::new(event, payload))
    }

    fn fan_out(&self, targets: &[Arc<ConnectionHandle>], frame: Frame) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(event = %frame.event, error = %e, "Failed to serialize frame");
                return 0;
            }
        };

        let mut delivered = 0;
        for handle in targets {
            if handle.enqueue(OutboundMessage::Text(text.clone())) {
                delivered += 1;
            }
        }

        tracing::debug!(
            event = %frame.event,
            targets = targets.len(),
            delivered = delivered,
            "Fanned out event"
        );
        delivered
    }

    pub fn connection(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.registry.get(connection_id)
    }

    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.registry.all()
    }

    pub fn room_members(&self, room: &str) -> Vec<Arc<ConnectionHandle>> {
        self.rooms
            .member_ids(room)
            .into_iter()
            .filter_map(|id| self.registry.get(id))
            .collect()
    }

    pub fn rooms(&self) -> Vec<String> {
        self.rooms.room_names()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.len(),
            rooms: self.rooms.counts(),
        }
    }

    /// Close every connection, preferring a graceful close frame and falling
    /// back to forced termination if the outbound buffer is unavailable.
    /// Returns the number of connections signalled.
    pub fn close_all(&self, reason: &str) -> usize {
        let connections = self.registry.all();
        for handle in &connections {
            if !handle.close_gracefully(reason) {
                handle.disconnect_with_reason(reason);
            }
        }
        connections.len()
    }

    /// Shut down the hub's connection population. Background timers are
    /// stopped separately via the shutdown broadcast channel.
    pub fn shutdown(&self) -> usize {
        self.close_all("server shutdown")
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connect(hub: &Hub) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(32);
        (hub.connect(tx), rx)
    }

    fn recv_frame(rx: &mut mpsc::Receiver<OutboundMessage>) -> Option<Frame> {
        match rx.try_recv().ok()? {
            OutboundMessage::Frame(frame) => Some(frame),
            OutboundMessage::Text(text) => Frame::decode(&text),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_connection_event_fires_on_connect() {
        let hub = Hub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            hub.on(lifecycle::CONNECTION, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (_handle, _rx) = connect(&hub);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_fires_disconnect_exactly_once() {
        let hub = Hub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            hub.on(lifecycle::DISCONNECT, move |ctx| {
                assert_eq!(ctx.payload["reason"], "peer closed");
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (handle, _rx) = connect(&hub);
        hub.teardown(handle.id, "peer closed");
        hub.teardown(handle.id, "peer closed");

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(hub.connection(handle.id).is_none());
    }

    #[tokio::test]
    async fn test_teardown_sweeps_room_memberships() {
        let hub = Hub::new();
        let (handle, _rx) = connect(&hub);
        let (other, _other_rx) = connect(&hub);

        hub.join(&handle, "general");
        hub.join(&handle, "other");
        hub.join(&other, "general");

        hub.teardown(handle.id, "peer closed");

        assert!(hub
            .room_members("general")
            .iter()
            .all(|h| h.id == other.id));
        assert!(hub.room_members("other").is_empty());
        assert!(!hub.rooms().contains(&"other".to_string()));
    }

    #[tokio::test]
    async fn test_broadcast_room_reaches_members_only() {
        let hub = Hub::new();
        let (member, mut member_rx) = connect(&hub);
        let (outsider, mut outsider_rx) = connect(&hub);

        hub.join(&member, "general");
        hub.join(&outsider, "other");

        let delivered = hub.broadcast_room("general", "welcome", json!({"message": "Hello!"}));
        assert_eq!(delivered, 1);

        let frame = recv_frame(&mut member_rx).expect("member should receive the frame");
        assert_eq!(frame.event, "welcome");
        assert_eq!(frame.payload, json!({"message": "Hello!"}));

        assert!(recv_frame(&mut outsider_rx).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_empty_room_is_silent_noop() {
        let hub = Hub::new();
        assert_eq!(hub.broadcast_room("empty", "welcome", Value::Null), 0);
    }

    #[tokio::test]
    async fn test_dispatch_frame_routes_named_and_message_events() {
        let hub = Hub::new();
        let (handle, _rx) = connect(&hub);
        let named = Arc::new(AtomicUsize::new(0));
        let generic = Arc::new(AtomicUsize::new(0));

        {
            let named = named.clone();
            hub.on("chat", move |ctx| {
                assert_eq!(ctx.payload, json!({"message": "hi"}));
                named.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let generic = generic.clone();
            hub.on(lifecycle::MESSAGE, move |ctx| {
                assert_eq!(ctx.payload["event"], "chat");
                generic.fetch_add(1, Ordering::SeqCst);
            });
        }

        hub.dispatch_frame(&handle, Frame::new("chat", json!({"message": "hi"})));
        assert_eq!(named.load(Ordering::SeqCst), 1);
        assert_eq!(generic.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbound_reserved_names_are_dropped() {
        let hub = Hub::new();
        let (handle, _rx) = connect(&hub);
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            hub.on(lifecycle::DISCONNECT, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        hub.dispatch_frame(&handle, Frame::new("disconnect", Value::Null));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_report_error_does_not_close_connection() {
        let hub = Hub::new();
        let (handle, _rx) = connect(&hub);
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            hub.on(lifecycle::ERROR, move |ctx| {
                assert_eq!(ctx.payload["detail"], "broken pipe");
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        hub.report_error(&handle, "broken pipe");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(hub.connection(handle.id).is_some());
    }

    #[tokio::test]
    async fn test_join_after_close_leaves_no_ghost_member() {
        let hub = Hub::new();
        let (handle, _rx) = connect(&hub);

        hub.teardown(handle.id, "peer closed");
        hub.join(&handle, "general");

        assert!(hub.room_members("general").is_empty());
        assert!(!hub.rooms().contains(&"general".to_string()));
        assert!(!handle.is_member_of("general"));
        assert!(hub.stats().rooms.is_empty());
    }

    #[tokio::test]
    async fn test_stats_reflect_population() {
        let hub = Hub::new();
        let (a, _rx_a) = connect(&hub);
        let (_b, _rx_b) = connect(&hub);
        hub.join(&a, "general");

        let stats = hub.stats();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.rooms.get("general"), Some(&1));
    }

    #[tokio::test]
    async fn test_close_all_signals_every_connection() {
        let hub = Hub::new();
        let (_a, mut rx_a) = connect(&hub);
        let (_b, mut rx_b) = connect(&hub);

        assert_eq!(hub.shutdown(), 2);
        assert!(matches!(rx_a.try_recv(), Ok(OutboundMessage::Close)));
        assert!(matches!(rx_b.try_recv(), Ok(OutboundMessage::Close)));
    }
}
