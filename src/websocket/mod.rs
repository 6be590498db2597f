mod handler;
mod message;

pub use handler::ws_handler;
pub use message::{Frame, OutboundMessage};
