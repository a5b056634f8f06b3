// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Liveness watchdog for the message queue.
//!
//! Every interval the watchdog asks the queue whether it made progress. A
//! queue with pending work and no completed transaction since the previous
//! check is considered deadlocked, and the runtime is shut down. Recovery is
//! left to whatever supervises the process.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::queue::QueueHandle;
use crate::shutdown::{ShutdownController, ShutdownReason};

/// Background task that shuts the runtime down when the queue stops moving.
#[derive(Debug, Clone)]
pub struct Watchdog {
    queue: QueueHandle,
    shutdown: ShutdownController,
    interval: Duration,
}

impl Watchdog {
    /// Create a watchdog checking `queue` every `interval`.
    pub fn new(queue: QueueHandle, shutdown: ShutdownController, interval: Duration) -> Self {
        Self {
            queue,
            shutdown,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Run until shutdown is triggered, by anyone.
    pub async fn run(self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Liveness watchdog started"
        );
        let token = self.shutdown.token();

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                _ = tokio::time::sleep(self.interval) => {
                    if self.queue.progress() {
                        debug!(pending = self.queue.pending(), "Queue is making progress");
                        continue;
                    }
                    warn!(
                        pending = self.queue.pending(),
                        completed = self.queue.completed(),
                        "Queue deadlocked, shutting down"
                    );
                    self.shutdown.trigger_or_exit(ShutdownReason::Liveness);
                    break;
                }
            }
        }

        debug!("Liveness watchdog stopped");
    }
}
