// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store.
//!
//! Implements [`LockBackend`] and [`ImpulseQueue`] with the same semantics as
//! the Redis scripts. Every operation runs under one mutex, which gives it the
//! atomicity the scripts get from the server. Used for single-node embedding
//! and throughout the test-suite.
//!
//! Lock and state expiry follow `tokio::time`, so paused-clock tests can
//! advance past a lease TTL.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{Result, StoreError};
use crate::keys::{FlowKeys, KeyStrategy};
use crate::lock::{LoadedFlow, LockBackend, StateRetention};
use crate::model::{FlowLease, Impulse};
use crate::queue::{
    ImpulseQueue, NackOutcome, QueueDepths, encode_impulse, nack_destination,
};

#[derive(Debug)]
struct HeldLock {
    token: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    locks: HashMap<String, HeldLock>,
    values: HashMap<String, StoredValue>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    /// Per key, members with their deadline in epoch millis.
    inflight: HashMap<String, Vec<(i64, Vec<u8>)>>,
}

impl Inner {
    fn holder(&mut self, key: &str) -> Option<&str> {
        let now = Instant::now();
        if self.locks.get(key).is_some_and(|l| l.expires_at <= now) {
            self.locks.remove(key);
        }
        self.locks.get(key).map(|l| l.token.as_str())
    }

    fn holds(&mut self, key: &str, lease: &FlowLease) -> bool {
        lease.success && self.holder(key) == Some(lease.token.as_str())
    }

    fn value(&mut self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        if self
            .values
            .get(key)
            .is_some_and(|v| v.expires_at.is_some_and(|at| at <= now))
        {
            self.values.remove(key);
        }
        self.values.get(key).map(|v| v.bytes.clone())
    }

    fn list(&mut self, key: &str) -> &mut VecDeque<Vec<u8>> {
        self.lists.entry(key.to_string()).or_default()
    }

    fn list_len(&self, key: &str) -> usize {
        self.lists.get(key).map_or(0, VecDeque::len)
    }

    fn zadd(&mut self, key: &str, score: i64, member: Vec<u8>) {
        let set = self.inflight.entry(key.to_string()).or_default();
        match set.iter_mut().find(|(_, m)| *m == member) {
            Some(entry) => entry.0 = score,
            None => set.push((score, member)),
        }
    }

    fn zrem(&mut self, key: &str, member: &[u8]) -> bool {
        let Some(set) = self.inflight.get_mut(key) else {
            return false;
        };
        let before = set.len();
        set.retain(|(_, m)| m != member);
        before != set.len()
    }
}

/// In-process implementation of both store traits.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    keys: KeyStrategy,
    visibility_timeout: Duration,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("prefix", &self.keys.prefix())
            .field("visibility_timeout", &self.visibility_timeout)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(KeyStrategy::default(), Duration::from_secs(30))
    }
}

impl MemoryStore {
    pub fn new(keys: KeyStrategy, visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            keys,
            visibility_timeout,
        }
    }

    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.keys
    }

    /// Whether any lease currently holds the lock key.
    pub async fn is_locked(&self, keys: &FlowKeys) -> bool {
        self.inner.lock().await.holder(&keys.lock).is_some()
    }

    /// Number of impulses buffered in a flow's inbox.
    pub async fn inbox_len(&self, keys: &FlowKeys) -> usize {
        self.inner.lock().await.list_len(&keys.inbox)
    }

    /// Remaining lifetime of a state key, `None` when absent or without expiry.
    pub async fn state_ttl(&self, keys: &FlowKeys) -> Option<Duration> {
        let mut inner = self.inner.lock().await;
        inner.value(&keys.state)?;
        let expires_at = inner.values.get(&keys.state)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    fn decode_entry(group: &str, bytes: &[u8]) -> Option<Impulse> {
        match codec::decode::<Impulse>(bytes) {
            Ok(impulse) => impulse,
            Err(e) => {
                warn!(group, error = %e, "Dead-lettering undecodable queue entry");
                None
            }
        }
    }

    fn deadline(&self) -> i64 {
        let visibility = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_add(visibility)
    }
}

#[async_trait]
impl LockBackend for MemoryStore {
    async fn acquire_and_load(
        &self,
        keys: &FlowKeys,
        token: &str,
        ttl: Duration,
        max_inbox: usize,
    ) -> Result<Option<LoadedFlow>, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.holder(&keys.lock).is_some() {
            return Ok(None);
        }

        inner.locks.insert(
            keys.lock.clone(),
            HeldLock {
                token: token.to_string(),
                expires_at: Instant::now() + ttl.max(Duration::from_millis(1)),
            },
        );

        let state = inner.value(&keys.state).filter(|s| !s.is_empty());
        let inbox_list = inner.list(&keys.inbox);
        let take = max_inbox.min(inbox_list.len());
        let inbox: Vec<Vec<u8>> = inbox_list.drain(..take).collect();

        Ok(Some(LoadedFlow { state, inbox }))
    }

    async fn save_and_release(
        &self,
        keys: &FlowKeys,
        lease: &FlowLease,
        state: &[u8],
        retention: StateRetention,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.holds(&keys.lock, lease) {
            return Ok(false);
        }

        match retention {
            StateRetention::Keep => {
                inner.values.insert(
                    keys.state.clone(),
                    StoredValue {
                        bytes: state.to_vec(),
                        expires_at: None,
                    },
                );
            }
            StateRetention::Delete => {
                inner.values.remove(&keys.state);
            }
            StateRetention::Expire(ttl) => {
                inner.values.insert(
                    keys.state.clone(),
                    StoredValue {
                        bytes: state.to_vec(),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
            }
        }
        inner.locks.remove(&keys.lock);
        Ok(true)
    }

    async fn extend(
        &self,
        keys: &FlowKeys,
        lease: &FlowLease,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.holds(&keys.lock, lease) {
            return Ok(false);
        }
        if let Some(lock) = inner.locks.get_mut(&keys.lock) {
            lock.expires_at = Instant::now() + ttl;
        }
        Ok(true)
    }

    async fn release(&self, keys: &FlowKeys, lease: &FlowLease) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.holds(&keys.lock, lease) {
            return Ok(false);
        }
        inner.locks.remove(&keys.lock);
        Ok(true)
    }

    async fn append_inbox(&self, keys: &FlowKeys, impulse: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.list(&keys.inbox).push_back(impulse.to_vec());
        Ok(())
    }

    async fn load_state(&self, keys: &FlowKeys) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.value(&keys.state).filter(|s| !s.is_empty()))
    }
}

#[async_trait]
impl ImpulseQueue for MemoryStore {
    async fn enqueue(&self, group: &str, impulse: &Impulse) -> Result<()> {
        let bytes = encode_impulse(impulse)?;
        let mut inner = self.inner.lock().await;
        inner
            .list(&self.keys.queue_pending_key(group))
            .push_back(bytes);
        Ok(())
    }

    async fn dequeue(&self, group: &str) -> Result<Option<Impulse>> {
        let keys = self.keys.queue_keys(group);
        let deadline = self.deadline();
        let mut inner = self.inner.lock().await;

        while let Some(bytes) = inner.list(&keys.pending).pop_front() {
            match Self::decode_entry(group, &bytes) {
                Some(impulse) => {
                    inner.zadd(&keys.inflight, deadline, bytes);
                    return Ok(Some(impulse));
                }
                None => inner.list(&keys.dlq).push_back(bytes),
            }
        }
        Ok(None)
    }

    async fn dequeue_batch(&self, group: &str, max: usize) -> Result<Vec<Impulse>> {
        let keys = self.keys.queue_keys(group);
        let deadline = self.deadline();
        let mut inner = self.inner.lock().await;

        let pending = inner.list(&keys.pending);
        let take = max.min(pending.len());
        let popped: Vec<Vec<u8>> = pending.drain(..take).collect();

        let mut impulses = Vec::with_capacity(popped.len());
        for bytes in popped {
            match Self::decode_entry(group, &bytes) {
                Some(impulse) => {
                    impulses.push(impulse);
                    inner.zadd(&keys.inflight, deadline, bytes);
                }
                None => inner.list(&keys.dlq).push_back(bytes),
            }
        }
        Ok(impulses)
    }

    async fn ack(&self, group: &str, impulse: &Impulse) -> Result<()> {
        let member = encode_impulse(impulse)?;
        let mut inner = self.inner.lock().await;
        inner.zrem(&self.keys.queue_inflight_key(group), &member);
        Ok(())
    }

    async fn ack_batch(&self, group: &str, impulses: &[Impulse]) -> Result<()> {
        let members = impulses
            .iter()
            .map(encode_impulse)
            .collect::<Result<Vec<_>>>()?;
        let inflight_key = self.keys.queue_inflight_key(group);
        let mut inner = self.inner.lock().await;
        for member in &members {
            inner.zrem(&inflight_key, member);
        }
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

        let mut inner = self.inner.lock().await;
        if !inner.zrem(&keys.inflight, &current) {
            debug!(group, impulse_id = %impulse.id, "Nack of an impulse no longer inflight");
            return Ok(NackOutcome::Stale);
        }
        inner.list(destination).push_back(replacement);
        drop(inner);

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
        let keys = self.keys.queue_keys(group);
        let cutoff = now.timestamp_millis();
        let mut inner = self.inner.lock().await;

        let Some(set) = inner.inflight.get_mut(&keys.inflight) else {
            return Ok(0);
        };
        let mut expired: Vec<(i64, Vec<u8>)> = Vec::new();
        set.retain(|(score, member)| {
            if *score <= cutoff {
                expired.push((*score, member.clone()));
                false
            } else {
                true
            }
        });
        expired.sort();

        // Anything past the limit goes back to inflight untouched.
        let overflow = expired.split_off(limit.min(expired.len()));
        set.extend(overflow);

        let moved = expired.len();
        let pending = inner.list(&keys.pending);
        pending.extend(expired.into_iter().map(|(_, member)| member));
        Ok(moved)
    }

    async fn depths(&self, group: &str) -> Result<QueueDepths> {
        let keys = self.keys.queue_keys(group);
        let inner = self.inner.lock().await;
        Ok(QueueDepths {
            pending: inner.list_len(&keys.pending),
            inflight: inner.inflight.get(&keys.inflight).map_or(0, Vec::len),
            dlq: inner.list_len(&keys.dlq),
        })
    }

    async fn dead_letters(&self, group: &str, limit: usize) -> Result<Vec<Impulse>> {
        let key = self.keys.queue_dlq_key(group);
        let inner = self.inner.lock().await;
        Ok(inner
            .lists
            .get(&key)
            .map(|dlq| {
                dlq.iter()
                    .take(limit)
                    .filter_map(|bytes| Self::decode_entry(group, bytes))
                    .collect()
            })
            .unwrap_or_default())
    }
}
