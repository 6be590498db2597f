//! Reconnecting WebSocket client.
//!
//! A [`Client`] wraps one logical connection across reconnect cycles.
//! Event handlers are bound to the session, not to an individual transport
//! connection, so they keep firing after a reconnect without
//! re-registration. Reconnection uses a fixed delay between attempts;
//! consecutive failures count toward the configured maximum and the counter
//! resets on every successful connect.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::error::HubError;
use crate::events::{lifecycle, EventDispatcher, Subscription};
use crate::websocket::Frame;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    /// Whether to reconnect after a failed connect or a dropped connection
    pub reconnect: bool,
    /// Fixed delay between reconnect attempts
    pub reconnect_interval: Duration,
    /// Consecutive failures tolerated before the session gives up
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8081/ws".to_string(),
            reconnect: true,
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    dispatcher: EventDispatcher<Value>,
    sender: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    stopped: AtomicBool,
    stop_notify: Notify,
    attempts: AtomicU32,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                dispatcher: EventDispatcher::new(),
                sender: RwLock::new(None),
                stopped: AtomicBool::new(false),
                stop_notify: Notify::new(),
                attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Register a handler for a named event. The hub emits `connection`,
    /// `disconnect` and `error` locally at lifecycle points; other names
    /// fire on matching inbound frames.
    pub fn on(
        &self,
        event: impl Into<String>,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.dispatcher.on(event, handler)
    }

    pub fn off(&self, subscription: &Subscription) {
        self.inner.dispatcher.off(subscription)
    }

    /// Send a named event with a payload. Silent no-op while disconnected.
    pub fn send(&self, event: impl Into<String>, payload: Value) {
        let frame = Frame::new(event, payload);
        let guard = self.inner.sender.read().unwrap();
        let Some(tx) = guard.as_ref() else {
            tracing::debug!(event = %frame.event, "Not connected, dropping send");
            return;
        };
        match frame.encode() {
            Ok(text) => {
                let _ = tx.send(Message::Text(text.into()));
            }
            Err(e) => tracing::error!(event = %frame.event, error = %e, "Failed to serialize frame"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.sender.read().unwrap().is_some()
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Disconnect and disable further auto-reconnect.
    pub fn close(&self) {
        self.inner.stopped.store(true, Ordering::Relaxed);
        self.inner.stop_notify.notify_waiters();
    }

    /// Connect and service the session until it is closed or reconnect
    /// attempts are exhausted. Typically spawned.
    pub async fn run(&self) -> Result<(), HubError> {
        loop {
            if self.inner.stopped.load(Ordering::Relaxed) {
                tracing::info!("Client stopped");
                return Ok(());
            }

            match connect_async(self.inner.config.url.as_str()).await {
                Ok((ws_stream, _response)) => {
                    tracing::info!(url = %self.inner.config.url, "Connected");
                    self.inner.attempts.store(0, Ordering::Relaxed);
                    self.emit_lifecycle(lifecycle::CONNECTION, Value::Null);

                    let reason = self.drive(ws_stream).await;

                    tracing::info!(reason = %reason, "Disconnected");
                    self.emit_lifecycle(lifecycle::DISCONNECT, json!({ "reason": reason }));
                }
                // A URL that cannot be parsed will never connect; retrying
                // is pointless
                Err(e @ tungstenite::Error::Url(_)) => {
                    tracing::error!(url = %self.inner.config.url, error = %e, "Invalid URL");
                    return Err(HubError::Transport(e));
                }
                Err(e) => {
                    tracing::warn!(url = %self.inner.config.url, error = %e, "Connect failed");
                    self.emit_lifecycle(lifecycle::ERROR, json!({ "detail": e.to_string() }));
                }
            }

            if self.inner.stopped.load(Ordering::Relaxed) {
                tracing::info!("Client stopped");
                return Ok(());
            }
            if !self.inner.config.reconnect {
                tracing::info!("Reconnect disabled, client finished");
                return Ok(());
            }

            let attempt = self.inner.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if attempt > self.inner.config.max_reconnect_attempts {
                tracing::warn!(
                    max_attempts = self.inner.config.max_reconnect_attempts,
                    "Reconnect attempts exhausted"
                );
                return Ok(());
            }

            tracing::info!(
                attempt = attempt,
                max_attempts = self.inner.config.max_reconnect_attempts,
                delay_ms = self.inner.config.reconnect_interval.as_millis() as u64,
                "Scheduling reconnect"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.reconnect_interval) => {}
                _ = self.inner.stop_notify.notified() => {
                    tracing::info!("Client stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Service one established connection until it closes. Returns the
    /// closing reason.
    async fn drive(&self, ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> String {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.inner.sender.write().unwrap().replace(tx);

        let reason = loop {
            // Arm the stop listener before reading the flag, otherwise a
            // close() landing between the flag check and the select would
            // be missed and an idle session would block on the next message
            let stop = self.inner.stop_notify.notified();
            tokio::pin!(stop);
            stop.as_mut().enable();

            if self.inner.stopped.load(Ordering::Relaxed) {
                let _ = ws_sender.send(Message::Close(None)).await;
                break "client disconnect";
            }

            tokio::select! {
                _ = &mut stop => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break "client disconnect";
                }
                outbound = rx.recv() => {
                    match outbound {
                        Some(msg) => {
                            if ws_sender.send(msg).await.is_err() {
                                break "send failed";
                            }
                        }
                        None => break "send channel closed",
                    }
                }
                inbound = ws_receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            // Malformed frames are dropped silently
                            if let Some(frame) = Frame::decode(&text) {
                                self.dispatch_inbound(frame);
                            }
                        }
                        Some(Ok(Message::Close(_))) => break "server closed",
                        Some(Ok(Message::Ping(data))) => {
                            // Answer liveness probes promptly even when we
                            // have nothing else to write
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break "send failed";
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "WebSocket receive error");
                            self.emit_lifecycle(
                                lifecycle::ERROR,
                                json!({ "detail": e.to_string() }),
                            );
                            break "transport error";
                        }
                        None => break "stream ended",
                    }
                }
            }
        };

        self.inner.sender.write().unwrap().take();
        reason.to_string()
    }

    fn dispatch_inbound(&self, frame: Frame) {
        // `connection` and `disconnect` are owned by the local session
        if frame.event == lifecycle::CONNECTION || frame.event == lifecycle::DISCONNECT {
            tracing::debug!(
                event = %frame.event,
                "Dropping inbound frame with reserved event name"
            );
            return;
        }

        self.inner.dispatcher.emit(&frame.event, &frame.payload);

        if frame.event != lifecycle::MESSAGE {
            let wrapper = json!({ "event": frame.event, "payload": frame.payload });
            self.inner.dispatcher.emit(lifecycle::MESSAGE, &wrapper);
        }
    }

    fn emit_lifecycle(&self, event: &str, payload: Value) {
        self.inner.dispatcher.emit(event, &payload);
    }
}
