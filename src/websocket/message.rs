use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application-level message carried over the transport's own framing.
///
/// Both directions use `payload` as the field name; `data` is accepted as an
/// inbound alias for compatibility with older peers. A missing payload
/// decodes as JSON null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, alias = "data")]
    pub payload: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Decode an inbound text frame. Malformed frames (invalid JSON, wrong
    /// shape, or missing the event field) yield `None` and are dropped by
    /// the caller.
    pub fn decode(text: &str) -> Option<Self> {
        match serde_json::from_str::<Self>(text) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed frame");
                None
            }
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages queued for a connection's send task.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// An event frame, serialized when sent
    Frame(Frame),
    /// A pre-serialized frame, shared across a fan-out
    Text(String),
    /// Transport-level liveness probe
    Ping,
    /// Instructs the send task to close the connection
    Close,
}
