//! Heartbeat-driven liveness detection.
//!
//! One probe in flight per connection: each tick either terminates a
//! connection that failed to answer the previous probe, or clears its
//! liveness flag and queues a new probe. Any pong (or inbound traffic)
//! restores the flag. Worst-case time to detect a dead peer is two
//! intervals. Probe sends never block the tick loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::hub::Hub;

pub struct HeartbeatTask {
    interval: Duration,
    hub: Arc<Hub>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(interval: Duration, hub: Arc<Hub>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            interval,
            hub,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        // A slow round delays the next tick instead of bursting
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.probe_connections();
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    fn probe_connections(&self) {
        let connections = self.hub.connections();
        if connections.is_empty() {
            return;
        }

        let mut probed = 0;
        let mut terminated = 0;

        for handle in connections {
            if !handle.is_alive() {
                tracing::info!(
                    connection_id = %handle.id,
                    "Terminating connection that missed a heartbeat"
                );
                handle.disconnect_with_reason("heartbeat timeout");
                terminated += 1;
            } else {
                handle.set_alive(false);
                handle.enqueue_ping();
                probed += 1;
            }
        }

        tracing::debug!(probed, terminated, "Heartbeat round completed");
    }
}
