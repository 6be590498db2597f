mod settings;

pub use settings::{HeartbeatConfig, ServerConfig, Settings};
