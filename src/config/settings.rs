use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// URL path the WebSocket endpoint is mounted on
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Maximum inbound message size, enforced by the transport
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Disabling is equivalent to configuring no heartbeat at all:
    /// unresponsive connections are then only detected on send failure.
    #[serde(default = "default_heartbeat_enabled")]
    pub enabled: bool,
    /// Probe interval in seconds. A connection that misses one full
    /// interval is terminated on the following tick.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Option<Duration> {
        self.enabled.then(|| Duration::from_secs(self.interval_secs))
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

fn default_heartbeat_enabled() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    30
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("server.ws_path", "/ws")?
            .set_default("server.max_payload_bytes", 64 * 1024)?
            .set_default("heartbeat.enabled", true)?
            .set_default("heartbeat.interval_secs", 30)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, HEARTBEAT_ENABLED, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: default_heartbeat_enabled(),
            interval_secs: default_heartbeat_interval(),
        }
    }
}
