// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reliable impulse queue.
//!
//! Each queue group is three store structures:
//!
//! ```text
//!   enqueue ──► pending (list) ──dequeue──► inflight (sorted by deadline) ──ack──► gone
//!                   ▲                              │
//!                   ├──────── nack, retryable ─────┤
//!                   ├──────── reclaim_expired ─────┤
//!                   │                              └── nack, exhausted ──► dlq (list)
//! ```
//!
//! Entries that fail to decode skip inflight and go straight to the DLQ.
//!
//! Delivery is at-least-once. An impulse is in exactly one of pending,
//! inflight or dlq until it is acked. Inflight entries are matched by their
//! encoded bytes, which is why impulses encode deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::codec::{self, SerializerType};
use crate::error::Result;
use crate::model::{Impulse, MAX_DELIVERY_COUNT};

/// Format every queued impulse is written in.
pub const QUEUE_FORMAT: SerializerType = SerializerType::MessagePack;

/// Where a nacked impulse went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back at the tail of pending.
    Requeued,
    /// Out of retries, or not retryable. Needs an operator to replay.
    DeadLettered,
    /// No longer inflight, so nothing moved. The reaper reclaimed it or
    /// another settlement got there first.
    Stale,
}

/// Entry counts of one queue group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub pending: usize,
    pub inflight: usize,
    pub dlq: usize,
}

impl QueueDepths {
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.inflight == 0
    }
}

/// Decide where a nack sends an impulse once its delivery count was bumped.
pub fn nack_destination(redelivered: &Impulse, retryable: bool) -> NackOutcome {
    if retryable && redelivered.delivery_count < MAX_DELIVERY_COUNT {
        NackOutcome::Requeued
    } else {
        NackOutcome::DeadLettered
    }
}

/// Encode an impulse the way the queue stores it.
pub fn encode_impulse(impulse: &Impulse) -> Result<Vec<u8>> {
    Ok(codec::encode(impulse, QUEUE_FORMAT)?)
}

/// Pending → inflight → DLQ work queue.
#[async_trait]
pub trait ImpulseQueue: Send + Sync {
    /// Append an impulse to the tail of pending.
    async fn enqueue(&self, group: &str, impulse: &Impulse) -> Result<()>;

    /// Move one impulse from pending to inflight.
    ///
    /// Returns `None` only when pending is empty. Undecodable entries met on
    /// the way are moved to the DLQ and the next entry is tried.
    async fn dequeue(&self, group: &str) -> Result<Option<Impulse>>;

    /// Move up to `max` impulses from pending to inflight in one round trip,
    /// oldest first. Undecodable entries are moved to the DLQ and left out of
    /// the result.
    async fn dequeue_batch(&self, group: &str, max: usize) -> Result<Vec<Impulse>>;

    /// Remove a processed impulse from inflight.
    async fn ack(&self, group: &str, impulse: &Impulse) -> Result<()>;

    /// Remove several processed impulses from inflight in one round trip.
    async fn ack_batch(&self, group: &str, impulses: &[Impulse]) -> Result<()>;

    /// Remove from inflight and either requeue (retryable and under the
    /// delivery ceiling) or dead-letter. Atomic. An impulse that is no longer
    /// inflight is left alone and reported as [`NackOutcome::Stale`].
    async fn nack(
        &self,
        group: &str,
        impulse: &Impulse,
        reason: &str,
        retryable: bool,
    ) -> Result<NackOutcome>;

    /// Move up to `limit` inflight entries whose deadline is at or before `now`
    /// back to pending. Returns how many moved.
    async fn reclaim_expired(&self, group: &str, now: DateTime<Utc>, limit: usize)
    -> Result<usize>;

    async fn depths(&self, group: &str) -> Result<QueueDepths>;

    /// Oldest dead-lettered impulses, up to `limit`.
    async fn dead_letters(&self, group: &str, limit: usize) -> Result<Vec<Impulse>>;
}
