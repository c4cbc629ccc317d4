// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrators pull impulses from the queue, run ticks and settle them.
//!
//! Two variants share the queue and executor interfaces:
//!
//! - [`ShardedOrchestrator`]: one ingestion pump, N shard workers fed through
//!   bounded channels (routing by flow id), one batching acker.
//! - [`PollingOrchestrator`]: N independent workers that dequeue, execute and
//!   settle one impulse at a time. Slower, useful as a baseline.
//!
//! Both settle a tick the same way:
//!
//! | Tick result                                   | Settlement          |
//! |-----------------------------------------------|---------------------|
//! | `Committed`, `NotEnergized`, `UnknownFlowType` | ack                 |
//! | `ConcurrencyFault`, `Err(_)`                  | nack, retryable     |
//! | `LockBusy`                                    | none, reaper returns it |
//!
//! A tick that panics is nacked like an `Err`; the worker keeps running.

mod backoff;
mod polling;
mod sharded;

use std::hash::{DefaultHasher, Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::executor::{TickExecutor, TickOutcome};
use crate::flow::FlowError;
use crate::model::Impulse;
use crate::queue::{ImpulseQueue, NackOutcome};

pub use backoff::{FAULT_DELAY, MAX_MISSES, MAX_POLL_DELAY, PollingBackoff};
pub use polling::PollingOrchestrator;
pub use sharded::{ACK_BATCH_SIZE, DEQUEUE_BATCH_SIZE, SHARD_CAPACITY, ShardedOrchestrator};

/// Shard owning `flow_id`. Stable for the life of the process.
pub fn shard_for(flow_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    flow_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// What to do with an impulse after its tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Nack as retryable with this reason.
    Retry(String),
    /// Leave it inflight.
    Leave,
}

impl Settlement {
    pub fn of(result: &Result<TickOutcome>) -> Self {
        match result {
            Ok(TickOutcome::Committed { .. })
            | Ok(TickOutcome::NotEnergized)
            | Ok(TickOutcome::UnknownFlowType) => Self::Ack,
            Ok(TickOutcome::ConcurrencyFault) => Self::Retry("concurrency fault".to_string()),
            Ok(TickOutcome::LockBusy) => Self::Leave,
            Err(e) => Self::Retry(e.to_string()),
        }
    }
}

/// Queue, executor and limits shared by every worker of an orchestrator.
#[derive(Clone)]
pub(crate) struct TickPipeline {
    queue: Arc<dyn ImpulseQueue>,
    executor: Arc<dyn TickExecutor>,
    group: Arc<str>,
    limiter: Option<Arc<Semaphore>>,
}

impl TickPipeline {
    pub(crate) fn new(
        queue: Arc<dyn ImpulseQueue>,
        executor: Arc<dyn TickExecutor>,
        group: &str,
        max_concurrent_flows: usize,
    ) -> Self {
        Self {
            queue,
            executor,
            group: Arc::from(group),
            limiter: (max_concurrent_flows > 0)
                .then(|| Arc::new(Semaphore::new(max_concurrent_flows))),
        }
    }

    pub(crate) fn group(&self) -> &str {
        &self.group
    }

    pub(crate) fn queue(&self) -> &Arc<dyn ImpulseQueue> {
        &self.queue
    }

    /// Run one tick, holding a concurrency permit when a limit is configured.
    pub(crate) async fn tick(&self, impulse: &Impulse) -> Settlement {
        let _permit: Option<OwnedSemaphorePermit> = match &self.limiter {
            Some(limiter) => limiter.clone().acquire_owned().await.ok(),
            None => None,
        };
        match AssertUnwindSafe(self.executor.execute_tick(impulse))
            .catch_unwind()
            .await
        {
            Ok(result) => Settlement::of(&result),
            Err(payload) => {
                let reason = FlowError::from_panic(payload.as_ref()).to_string();
                error!(
                    group = %self.group,
                    flow_id = %impulse.flow_id,
                    impulse_id = %impulse.id,
                    reason = %reason,
                    "Tick panicked"
                );
                Settlement::Retry(reason)
            }
        }
    }

    pub(crate) async fn ack(&self, impulse: &Impulse) {
        if let Err(e) = self.queue.ack(&self.group, impulse).await {
            warn!(
                group = %self.group,
                impulse_id = %impulse.id,
                error = %e,
                "Ack failed, impulse will be redelivered"
            );
        }
    }

    pub(crate) async fn nack(&self, impulse: &Impulse, reason: &str) {
        match self.queue.nack(&self.group, impulse, reason, true).await {
            Ok(NackOutcome::Requeued) => {}
            Ok(NackOutcome::Stale) => debug!(
                group = %self.group,
                impulse_id = %impulse.id,
                "Impulse was no longer inflight, nack dropped"
            ),
            Ok(NackOutcome::DeadLettered) => warn!(
                group = %self.group,
                flow_id = %impulse.flow_id,
                impulse_id = %impulse.id,
                reason,
                "Impulse exhausted its retries"
            ),
            Err(e) => error!(
                group = %self.group,
                impulse_id = %impulse.id,
                error = %e,
                "Nack failed, impulse stays inflight"
            ),
        }
    }
}

/// Sleep for `delay` unless `shutdown` fires first. Returns `false` on shutdown.
pub(crate) async fn idle(shutdown: &tokio_util::sync::CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoreError, StoreError};
    use crate::model::FlowCommand;

    #[test]
    fn test_shard_for_is_stable_and_in_range() {
        for shards in 1..8 {
            for id in ["a", "order-1", "order-2", ""] {
                let shard = shard_for(id, shards);
                assert!(shard < shards);
                assert_eq!(shard, shard_for(id, shards));
            }
        }
        assert_eq!(shard_for("anything", 0), 0);
    }

    #[test]
    fn test_shard_for_spreads_flows() {
        let used: std::collections::HashSet<_> =
            (0..200).map(|i| shard_for(&format!("flow-{}", i), 4)).collect();
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn test_settlement_policy() {
        let committed = Ok(TickOutcome::Committed {
            command: FlowCommand::Continue,
            elapsed: Duration::ZERO,
        });
        assert_eq!(Settlement::of(&committed), Settlement::Ack);
        assert_eq!(Settlement::of(&Ok(TickOutcome::NotEnergized)), Settlement::Ack);
        assert_eq!(Settlement::of(&Ok(TickOutcome::UnknownFlowType)), Settlement::Ack);
        assert_eq!(Settlement::of(&Ok(TickOutcome::LockBusy)), Settlement::Leave);
        assert!(matches!(
            Settlement::of(&Ok(TickOutcome::ConcurrencyFault)),
            Settlement::Retry(_)
        ));

        let failed: Result<TickOutcome> = Err(CoreError::Store(StoreError::Unavailable {
            operation: "acquire",
            details: "connection refused".to_string(),
        }));
        match Settlement::of(&failed) {
            Settlement::Retry(reason) => assert!(reason.contains("connection refused")),
            other => panic!("expected retry, got {:?}", other),
        }
    }
}
