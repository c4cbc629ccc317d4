// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{RedisStore, millis};
use crate::codec;
use crate::error::{Result, StoreError};
use crate::keys::QueueKeys;
use crate::model::Impulse;
use crate::queue::{
    ImpulseQueue, NackOutcome, QueueDepths, encode_impulse, nack_destination,
};

fn decode_entry(group: &str, bytes: &[u8]) -> Option<Impulse> {
    match codec::decode::<Impulse>(bytes) {
        Ok(impulse) => impulse,
        Err(e) => {
            warn!(group, error = %e, len = bytes.len(), "Undecodable queue entry");
            None
        }
    }
}

impl RedisStore {
    /// Move a popped entry that failed to decode from inflight to the DLQ.
    async fn dead_letter_raw(&self, keys: &QueueKeys, bytes: &[u8]) -> Result<()> {
        let mut conn = self.connection();
        let _: i64 = self
            .scripts
            .nack
            .key(&keys.inflight)
            .key(&keys.dlq)
            .arg(bytes)
            .arg(bytes)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::from_redis("dead_letter_raw", e))?;
        Ok(())
    }
}

#[async_trait]
impl ImpulseQueue for RedisStore {
    async fn enqueue(&self, group: &str, impulse: &Impulse) -> Result<()> {
        let bytes = encode_impulse(impulse)?;
        let mut conn = self.connection();
        conn.rpush::<_, _, ()>(self.keys.queue_pending_key(group), bytes)
            .await
            .map_err(|e| StoreError::from_redis("enqueue", e))?;
        Ok(())
    }

    async fn dequeue(&self, group: &str) -> Result<Option<Impulse>> {
        let keys = self.keys.queue_keys(group);
        let mut conn = self.connection();
        loop {
            let item: Option<Vec<u8>> = self
                .scripts
                .pop_work
                .key(&keys.pending)
                .key(&keys.inflight)
                .arg(Utc::now().timestamp_millis())
                .arg(millis(self.visibility_timeout))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| StoreError::from_redis("dequeue", e))?;

            let Some(bytes) = item else {
                return Ok(None);
            };
            match decode_entry(group, &bytes) {
                Some(impulse) => return Ok(Some(impulse)),
                None => self.dead_letter_raw(&keys, &bytes).await?,
            }
        }
    }

    async fn dequeue_batch(&self, group: &str, max: usize) -> Result<Vec<Impulse>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let keys = self.keys.queue_keys(group);
        let mut conn = self.connection();
        let items: Vec<Vec<u8>> = self
            .scripts
            .pop_work_batch
            .key(&keys.pending)
            .key(&keys.inflight)
            .arg(Utc::now().timestamp_millis())
            .arg(millis(self.visibility_timeout))
            .arg(max)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::from_redis("dequeue_batch", e))?;

        let mut impulses = Vec::with_capacity(items.len());
        for bytes in &items {
            match decode_entry(group, bytes) {
                Some(impulse) => impulses.push(impulse),
                None => self.dead_letter_raw(&keys, bytes).await?,
            }
        }
        Ok(impulses)
    }

    async fn ack(&self, group: &str, impulse: &Impulse) -> Result<()> {
        let member = encode_impulse(impulse)?;
        let mut conn = self.connection();
        conn.zrem::<_, _, ()>(self.keys.queue_inflight_key(group), member)
            .await
            .map_err(|e| StoreError::from_redis("ack", e))?;
        Ok(())
    }

    async fn ack_batch(&self, group: &str, impulses: &[Impulse]) -> Result<()> {
        if impulses.is_empty() {
            return Ok(());
        }
        let members = impulses
            .iter()
            .map(encode_impulse)
            .collect::<Result<Vec<_>>>()?;
        let mut conn = self.connection();
        conn.zrem::<_, _, ()>(self.keys.queue_inflight_key(group), members)
            .await
            .map_err(|e| StoreError::from_redis("ack_batch", e))?;
        Ok(())
    }

    async fn nack(
        &self,
        group: &str,
        impulse: &Impulse,
        reason: &str,
        retryable: bool,
    ) -> Result<NackOutcome> {
        let current = encode_impulse(impulse)?;
        let next = impulse.redelivered(reason);
        let outcome = nack_destination(&next, retryable);
        let replacement = encode_impulse(&next)?;

        let keys = self.keys.queue_keys(group);
        let destination = if outcome == NackOutcome::Requeued {
            &keys.pending
        } else {
            &keys.dlq
        };

        let mut conn = self.connection();
        let moved: i64 = self
            .scripts
            .nack
            .key(&keys.inflight)
            .key(destination)
            .arg(current)
            .arg(replacement)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::from_redis("nack", e))?;

        if moved == 0 {
            debug!(group, impulse_id = %impulse.id, "Nack of an impulse no longer inflight");
            return Ok(NackOutcome::Stale);
        }
        if outcome == NackOutcome::DeadLettered {
            warn!(
                group,
                impulse_id = %impulse.id,
                flow_id = %impulse.flow_id,
                delivery_count = next.delivery_count,
                reason,
                "Impulse moved to dead-letter queue"
            );
        }
        Ok(outcome)
    }

    async fn reclaim_expired(
        &self,
        group: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize> {
        if limit == 0 {
            return Ok(0);
        }
        let keys = self.keys.queue_keys(group);
        let mut conn = self.connection();
        let moved: usize = self
            .scripts
            .reclaim_expired
            .key(&keys.inflight)
            .key(&keys.pending)
            .arg(now.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::from_redis("reclaim_expired", e))?;
        Ok(moved)
    }

    async fn depths(&self, group: &str) -> Result<QueueDepths> {
        let keys = self.keys.queue_keys(group);
        let mut conn = self.connection();
        let (pending, inflight, dlq): (usize, usize, usize) = redis::pipe()
            .llen(&keys.pending)
            .zcard(&keys.inflight)
            .llen(&keys.dlq)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::from_redis("depths", e))?;
        Ok(QueueDepths {
            pending,
            inflight,
            dlq,
        })
    }

    async fn dead_letters(&self, group: &str, limit: usize) -> Result<Vec<Impulse>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit - 1).unwrap_or(isize::MAX);
        let mut conn = self.connection();
        let items: Vec<Vec<u8>> = conn
            .lrange(self.keys.queue_dlq_key(group), 0, stop)
            .await
            .map_err(|e| StoreError::from_redis("dead_letters", e))?;
        Ok(items
            .iter()
            .filter_map(|bytes| decode_entry(group, bytes))
            .collect())
    }
}
