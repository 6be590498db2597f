//! Shared helpers for integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;

use roomcast::config::{HeartbeatConfig, ServerConfig, Settings};
use roomcast::server::{create_app, AppState};

/// Start a hub server on an ephemeral port. Heartbeat is disabled so tests
/// control liveness timing themselves.
pub async fn start_server() -> (AppState, SocketAddr) {
    let settings = Settings {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ws_path: "/ws".to_string(),
            max_payload_bytes: 64 * 1024,
        },
        heartbeat: HeartbeatConfig {
            enabled: false,
            interval_secs: 30,
        },
    };
    let state = AppState::new(settings);
    let app = create_app(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, addr)
}

/// Poll until `condition` holds, failing the test after `timeout`.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
