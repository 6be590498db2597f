use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::hub::{ConnectionHandle, Hub};
use crate::server::AppState;

use super::message::{Frame, OutboundMessage};

const CHANNEL_BUFFER_SIZE: usize = 32;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let ws = ws.max_message_size(state.settings.server.max_payload_bytes);
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
#[tracing::instrument(name = "ws.connection", skip(socket, state))]
async fn handle_socket(socket: WebSocket, state: AppState) {
    // Channel for messages queued toward this connection
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(CHANNEL_BUFFER_SIZE);

    let handle = state.hub.connect(tx);
    let connection_id = handle.id;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task draining the outbound channel into the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let outcome = match msg {
                OutboundMessage::Frame(frame) => match frame.encode() {
                    Ok(text) => ws_sender.send(Message::Text(text.into())).await,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize frame");
                        continue;
                    }
                },
                OutboundMessage::Text(text) => ws_sender.send(Message::Text(text.into())).await,
                OutboundMessage::Ping => ws_sender.send(Message::Ping(Bytes::new())).await,
                OutboundMessage::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if outcome.is_err() {
                break;
            }
        }
    });

    // Task routing inbound messages through the hub
    let hub = state.hub.clone();
    let recv_handle = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if let Some(reason) = process_message(msg, &hub, &recv_handle) {
                        return reason;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = %recv_handle.id,
                        error = %e,
                        "WebSocket receive error"
                    );
                    hub.report_error(&recv_handle, &e.to_string());
                    return "transport error".to_string();
                }
            }
        }
        "stream ended".to_string()
    });

    // First closing signal wins: forced disconnect, send side gone, or the
    // receive side observing close/error.
    let reason = tokio::select! {
        _ = handle.closed() => "forced disconnect".to_string(),
        _ = &mut send_task => {
            recv_task.abort();
            "connection closed".to_string()
        }
        r = &mut recv_task => {
            send_task.abort();
            r.unwrap_or_else(|_| "receive task failed".to_string())
        }
    };
    send_task.abort();
    recv_task.abort();

    state.hub.teardown(connection_id, &reason);
}

/// Process one inbound transport message. Returns the closing reason once
/// the connection should be torn down.
fn process_message(msg: Message, hub: &Arc<Hub>, handle: &Arc<ConnectionHandle>) -> Option<String> {
    match msg {
        Message::Text(text) => {
            // Malformed frames are dropped without surfacing an error
            if let Some(frame) = Frame::decode(&text) {
                hub.dispatch_frame(handle, frame);
            }
            None
        }
        Message::Binary(_) => {
            handle.send(
                "error",
                serde_json::json!({
                    "code": "UNSUPPORTED_FORMAT",
                    "message": "Binary messages are not supported",
                }),
            );
            None
        }
        Message::Ping(_) => {
            // Axum answers the pong itself; any traffic proves liveness
            handle.set_alive(true);
            None
        }
        Message::Pong(_) => {
            handle.set_alive(true);
            None
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            Some("peer closed".to_string())
        }
    }
}
