// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sharded pipeline.
//!
//! ```text
//!                      ┌─► shard 0 ─┐
//!  queue ──► pump ─────┼─► shard 1 ─┼──► acker ──► ack_batch
//!        (batch pull)  └─► shard N ─┘
//!                        │ nack inline on failure
//! ```
//!
//! Every impulse of a flow id lands on the same shard, so a flow's impulses
//! are ticked in arrival order. Shard channels are bounded, which pushes back
//! on the pump when a shard falls behind.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{FAULT_DELAY, Settlement, TickPipeline, idle, shard_for};
use crate::config::FlowWireConfig;
use crate::executor::TickExecutor;
use crate::model::Impulse;
use crate::queue::ImpulseQueue;

/// Capacity of each shard channel.
pub const SHARD_CAPACITY: usize = 1000;

/// Acks flushed per `ack_batch` call.
pub const ACK_BATCH_SIZE: usize = 100;

/// Impulses requested per pump round trip.
pub const DEQUEUE_BATCH_SIZE: usize = 100;

/// Pump, shard workers and acker over one queue group.
pub struct ShardedOrchestrator {
    pipeline: TickPipeline,
    shards: usize,
    poll_interval: Duration,
}

impl std::fmt::Debug for ShardedOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedOrchestrator")
            .field("group", &self.pipeline.group())
            .field("shards", &self.shards)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl ShardedOrchestrator {
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
            shards: orchestrator.concurrency.max(1),
            poll_interval: orchestrator.poll_interval,
        }
    }

    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Run until `shutdown` fires, then drain shards and pending acks.
    pub async fn run(self, shutdown: CancellationToken) {
        let group = self.pipeline.group().to_string();
        info!(group = %group, shards = self.shards, "Sharded orchestrator started");

        let (ack_tx, ack_rx) = mpsc::unbounded_channel::<Impulse>();
        let acker = tokio::spawn(run_acker(self.pipeline.clone(), ack_rx));

        let mut senders = Vec::with_capacity(self.shards);
        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(self.shards);
        for shard in 0..self.shards {
            let (tx, rx) = mpsc::channel(SHARD_CAPACITY);
            senders.push(tx);
            workers.push(tokio::spawn(run_shard(
                shard,
                self.pipeline.clone(),
                rx,
                ack_tx.clone(),
            )));
        }
        // Only shard workers hold the ack sender from here on.
        drop(ack_tx);

        self.pump(&senders, &shutdown).await;

        info!(group = %group, "Ingestion stopped, draining shards");
        drop(senders);
        for (shard, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!(shard, error = %e, "Shard worker panicked");
            }
        }
        if let Err(e) = acker.await {
            error!(error = %e, "Acker panicked");
        }
        info!(group = %group, "Sharded orchestrator stopped");
    }

    async fn pump(&self, senders: &[mpsc::Sender<Impulse>], shutdown: &CancellationToken) {
        let queue = self.pipeline.queue();
        let group = self.pipeline.group();

        while !shutdown.is_cancelled() {
            let batch = match queue.dequeue_batch(group, DEQUEUE_BATCH_SIZE).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(group = %group, error = %e, "Dequeue failed, backing off");
                    if !idle(shutdown, FAULT_DELAY).await {
                        return;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if !idle(shutdown, self.poll_interval).await {
                    return;
                }
                continue;
            }

            debug!(group = %group, size = batch.len(), "Routing batch");
            for impulse in batch {
                let shard = shard_for(&impulse.flow_id, senders.len());
                let sent = tokio::select! {
                    biased;
                    // Unsent impulses stay inflight and are reclaimed later.
                    _ = shutdown.cancelled() => return,
                    sent = senders[shard].send(impulse) => sent,
                };
                if sent.is_err() {
                    warn!(shard, "Shard worker is gone, stopping ingestion");
                    return;
                }
            }
        }
    }
}

async fn run_shard(
    shard: usize,
    pipeline: TickPipeline,
    mut rx: mpsc::Receiver<Impulse>,
    acks: mpsc::UnboundedSender<Impulse>,
) {
    debug!(shard, "Shard worker started");
    while let Some(impulse) = rx.recv().await {
        match pipeline.tick(&impulse).await {
            Settlement::Ack => {
                if let Err(mpsc::error::SendError(impulse)) = acks.send(impulse) {
                    pipeline.ack(&impulse).await;
                }
            }
            Settlement::Retry(reason) => pipeline.nack(&impulse, &reason).await,
            Settlement::Leave => {
                debug!(shard, impulse_id = %impulse.id, "Leaving impulse inflight");
            }
        }
    }
    debug!(shard, "Shard worker drained");
}

async fn run_acker(pipeline: TickPipeline, mut rx: mpsc::UnboundedReceiver<Impulse>) {
    let mut batch = Vec::with_capacity(ACK_BATCH_SIZE);
    while rx.recv_many(&mut batch, ACK_BATCH_SIZE).await > 0 {
        flush_acks(&pipeline, &batch).await;
        batch.clear();
    }
    debug!(group = %pipeline.group(), "Acker drained");
}

async fn flush_acks(pipeline: &TickPipeline, batch: &[Impulse]) {
    let Err(e) = pipeline.queue().ack_batch(pipeline.group(), batch).await else {
        return;
    };
    warn!(
        group = %pipeline.group(),
        size = batch.len(),
        error = %e,
        "Batch ack failed, acking one by one"
    );
    for impulse in batch {
        pipeline.ack(impulse).await;
    }
}
