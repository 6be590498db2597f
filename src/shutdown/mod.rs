//! Graceful shutdown handling for the hub.
//!
//! Coordinated shutdown:
//! 1. Signals background tasks (heartbeat) to stop
//! 2. Closes every connection, gracefully where possible
//! 3. Waits a bounded time for the registry to drain

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::hub::Hub;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for connections to finish closing (default: 10 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Handles graceful shutdown of the hub
pub struct GracefulShutdown {
    hub: Arc<Hub>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(hub: Arc<Hub>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            hub,
            shutdown_tx,
            config: ShutdownConfig::default(),
        }
    }

    pub fn with_config(
        hub: Arc<Hub>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            hub,
            shutdown_tx,
            config,
        }
    }

    /// Execute the shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.hub.stats().connections)
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        // Phase 1: stop background tasks
        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping background tasks");
        let _ = self.shutdown_tx.send(());

        // Phase 2: close every connection
        tracing::info!("Phase 2: Closing connections");
        result.connections_signalled = self.hub.close_all(reason);

        // Phase 3: bounded wait for connection tasks to tear down
        tracing::info!("Phase 3: Waiting for connections to close");
        result.connections_closed = self.wait_for_drain().await;

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            connections_signalled = result.connections_signalled,
            connections_closed = result.connections_closed,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    async fn wait_for_drain(&self) -> usize {
        let initial = self.hub.stats().connections;
        if initial == 0 {
            return 0;
        }

        let hub = self.hub.clone();
        let drain_future = async {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if hub.stats().connections == 0 {
                    break;
                }
            }
        };

        let _ = timeout(self.config.drain_timeout, drain_future).await;

        let remaining = self.hub.stats().connections;
        if remaining > 0 {
            tracing::warn!(
                remaining_connections = remaining,
                "Some connections did not close gracefully"
            );
        }

        // Connections arriving during the drain window can push the count
        // above the initial snapshot
        initial.saturating_sub(remaining)
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether shutdown completed
    pub success: bool,
    /// Number of connections that were sent a close signal
    pub connections_signalled: usize,
    /// Number of connections that actually closed within the drain window
    pub connections_closed: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}
