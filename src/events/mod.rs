//! Named event dispatch.
//!
//! Handlers for an event name fire synchronously in registration order. A
//! panicking handler is reported through tracing and does not prevent the
//! remaining handlers from running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Lifecycle event names emitted by the hub itself. Inbound frames that
/// claim one of these names are dropped rather than dispatched.
pub mod lifecycle {
    pub const CONNECTION: &str = "connection";
    pub const DISCONNECT: &str = "disconnect";
    pub const ERROR: &str = "error";
    pub const MESSAGE: &str = "message";

    pub fn is_reserved(name: &str) -> bool {
        matches!(name, CONNECTION | DISCONNECT | ERROR | MESSAGE)
    }
}

type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Token returned by [`EventDispatcher::on`], used to remove the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }
}

/// Maps event names to ordered handler lists.
///
/// Generic over the handler argument: the server dispatches
/// [`EventContext`](crate::hub::EventContext) values, the client dispatches
/// raw JSON payloads.
pub struct EventDispatcher<A> {
    handlers: DashMap<String, Vec<(u64, Handler<A>)>>,
    next_id: AtomicU64,
}

impl<A> EventDispatcher<A> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for an event name. Handlers fire in registration
    /// order.
    pub fn on(
        &self,
        event: impl Into<String>,
        handler: impl Fn(&A) + Send + Sync + 'static,
    ) -> Subscription {
        let event = event.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(event.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { event, id }
    }

    /// Remove a previously registered handler. No-op if already removed.
    pub fn off(&self, subscription: &Subscription) {
        if let Some(mut entry) = self.handlers.get_mut(&subscription.event) {
            entry.retain(|(id, _)| *id != subscription.id);
            if entry.is_empty() {
                drop(entry);
                self.handlers.remove(&subscription.event);
            }
        }
    }

    /// Invoke every handler registered for `event`, in registration order.
    /// Returns the number of handlers invoked.
    pub fn emit(&self, event: &str, arg: &A) -> usize {
        // Snapshot under the shard lock, invoke without it, so handlers may
        // register or unregister handlers themselves.
        let snapshot: Vec<Handler<A>> = match self.handlers.get(event) {
            Some(entry) => entry.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };

        for handler in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(arg))).is_err() {
                tracing::error!(
                    event = %event,
                    "Event handler panicked, continuing with remaining handlers"
                );
            }
        }

        snapshot.len()
    }

    /// Number of handlers currently registered for an event name.
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.get(event).map(|v| v.len()).unwrap_or(0)
    }
}

impl<A> Default for EventDispatcher<A> {
    fn default() -> Self {
        Self::new()
    }
}
