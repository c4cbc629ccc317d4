// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polling orchestrator: N workers, one impulse at a time each.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{PollingBackoff, Settlement, TickPipeline, idle};
use crate::config::FlowWireConfig;
use crate::executor::TickExecutor;
use crate::queue::ImpulseQueue;

pub struct PollingOrchestrator {
    pipeline: TickPipeline,
    workers: usize,
    poll_interval: Duration,
}

impl std::fmt::Debug for PollingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingOrchestrator")
            .field("group", &self.pipeline.group())
            .field("workers", &self.workers)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl PollingOrchestrator {
    pub fn new(
        config: &FlowWireConfig,
        queue: Arc<dyn ImpulseQueue>,
        executor: Arc<dyn TickExecutor>,
    ) -> Self {
        let orchestrator = &config.orchestrator;
        Self {
            pipeline: TickPipeline::new(
                queue,
                executor,
                &orchestrator.queue_group,
                orchestrator.max_concurrent_flows,
            ),
            workers: orchestrator.concurrency.max(1),
            poll_interval: orchestrator.poll_interval,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run all workers until `shutdown` fires. Each finishes its current tick.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            group = %self.pipeline.group(),
            workers = self.workers,
            "Polling orchestrator started"
        );

        let handles: Vec<_> = (0..self.workers)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    self.pipeline.clone(),
                    self.poll_interval,
                    shutdown.clone(),
                ))
            })
            .collect();

        for (worker, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker, error = %e, "Polling worker panicked");
            }
        }
        info!(group = %self.pipeline.group(), "Polling orchestrator stopped");
    }
}

async fn run_worker(
    worker: usize,
    pipeline: TickPipeline,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut backoff = PollingBackoff::new(poll_interval);

    while !shutdown.is_cancelled() {
        let impulse = match pipeline.queue().dequeue(pipeline.group()).await {
            Ok(Some(impulse)) => impulse,
            Ok(None) => {
                if !idle(&shutdown, backoff.miss()).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                error!(
                    worker,
                    group = %pipeline.group(),
                    error = %e,
                    "Dequeue failed, backing off"
                );
                if !idle(&shutdown, backoff.fault()).await {
                    break;
                }
                continue;
            }
        };
        backoff.hit();

        match pipeline.tick(&impulse).await {
            Settlement::Ack => pipeline.ack(&impulse).await,
            Settlement::Retry(reason) => pipeline.nack(&impulse, &reason).await,
            Settlement::Leave => {
                debug!(worker, impulse_id = %impulse.id, "Leaving impulse inflight");
            }
        }
    }
    debug!(worker, "Polling worker stopped");
}
