// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inflight reaper.
//!
//! Impulses whose worker died, or that were left inflight on purpose after a
//! `LockBusy` tick, sit in inflight until their visibility deadline passes.
//! The reaper moves them back to pending.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FlowWireConfig;
use crate::error::Result;
use crate::queue::ImpulseQueue;

/// Entries moved per `reclaim_expired` call.
pub const RECLAIM_BATCH: usize = 500;

/// Shortest sweep interval.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct InflightReaper {
    queue: Arc<dyn ImpulseQueue>,
    group: String,
    interval: Duration,
}

impl std::fmt::Debug for InflightReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightReaper")
            .field("group", &self.group)
            .field("interval", &self.interval)
            .finish()
    }
}

impl InflightReaper {
    /// Sweep every half visibility timeout, at least once a second apart.
    pub fn new(config: &FlowWireConfig, queue: Arc<dyn ImpulseQueue>) -> Self {
        Self {
            queue,
            group: config.orchestrator.queue_group.clone(),
            interval: (config.orchestrator.visibility_timeout / 2).max(MIN_SWEEP_INTERVAL),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reclaim everything expired right now.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let mut total = 0;
        loop {
            let moved = self
                .queue
                .reclaim_expired(&self.group, now, RECLAIM_BATCH)
                .await?;
            total += moved;
            if moved < RECLAIM_BATCH {
                return Ok(total);
            }
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            group = %self.group,
            interval_ms = self.interval.as_millis() as u64,
            "Inflight reaper started"
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            match self.sweep().await {
                Ok(0) => debug!(group = %self.group, "Nothing to reclaim"),
                Ok(reclaimed) => info!(
                    group = %self.group,
                    reclaimed,
                    "Reclaimed expired inflight impulses"
                ),
                Err(e) => warn!(group = %self.group, error = %e, "Reclaim sweep failed"),
            }
        }
        info!(group = %self.group, "Inflight reaper stopped");
    }
}
