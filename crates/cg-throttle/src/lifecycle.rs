//! Background tasks for the throttling engine.
//!
//! Specs can change behind a group's back (config stores, operator edits),
//! so a periodic poll pushes current limits into every bin, and a slower
//! sweep drops bins nothing references anymore.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::throttler::Throttler;

/// Configuration for the poll/cleanup task.
#[derive(Debug, Clone)]
pub struct PollTaskConfig {
    /// Interval between spec refreshes.
    pub poll_interval: Duration,
    /// Interval between unused-bin sweeps.
    pub cleanup_interval: Duration,
}

impl Default for PollTaskConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Spawn the poll/cleanup task for the given group types. The task stops
/// when a message arrives on the shutdown channel.
pub fn spawn_poll_task(
    throttler: Arc<Throttler>,
    group_types: Vec<String>,
    config: PollTaskConfig,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut poll_ticker = tokio::time::interval(config.poll_interval);
        let mut cleanup_ticker = tokio::time::interval(config.cleanup_interval);

        loop {
            tokio::select! {
                _ = poll_ticker.tick() => {
                    for group_type in &group_types {
                        if let Err(e) = throttler.poll(group_type) {
                            warn!(group_type = %group_type, error = %e, "Throttle poll failed");
                        }
                    }
                }
                _ = cleanup_ticker.tick() => {
                    debug!("Sweeping unused throttle bins");
                    throttler.free_unused_resources();
                }
                _ = shutdown_rx.recv() => {
                    info!("Throttle poll task shutting down");
                    break;
                }
            }
        }
    });
}
