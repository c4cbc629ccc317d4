// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{RedisStore, millis};
use crate::error::StoreError;
use crate::keys::FlowKeys;
use crate::lock::{LoadedFlow, LockBackend, StateRetention};
use crate::model::FlowLease;

type AcquireReply = Option<(Option<Vec<u8>>, Vec<Vec<u8>>)>;

#[async_trait]
impl LockBackend for RedisStore {
    async fn acquire_and_load(
        &self,
        keys: &FlowKeys,
        token: &str,
        ttl: Duration,
        max_inbox: usize,
    ) -> Result<Option<LoadedFlow>, StoreError> {
        let mut conn = self.connection();
        let reply: AcquireReply = self
            .scripts
            .acquire_and_load
            .key(&keys.lock)
            .key(&keys.state)
            .key(&keys.inbox)
            .arg(token)
            .arg(millis(ttl).max(1))
            .arg(max_inbox)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::from_redis("acquire_and_load", e))?;

        Ok(reply.map(|(state, inbox)| LoadedFlow {
            state: state.filter(|s| !s.is_empty()),
            inbox,
        }))
    }

    async fn save_and_release(
        &self,
        keys: &FlowKeys,
        lease: &FlowLease,
        state: &[u8],
        retention: StateRetention,
    ) -> Result<bool, StoreError> {
        if !lease.success {
            return Ok(false);
        }
        let mut conn = self.connection();
        let committed: i64 = self
            .scripts
            .save_and_release
            .key(&keys.lock)
            .key(&keys.state)
            .arg(&lease.token)
            .arg(state)
            .arg(retention.as_millis_arg())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::from_redis("save_and_release", e))?;
        Ok(committed == 1)
    }

    async fn extend(
        &self,
        keys: &FlowKeys,
        lease: &FlowLease,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        if !lease.success {
            return Ok(false);
        }
        let mut conn = self.connection();
        let extended: i64 = self
            .scripts
            .extend_lock
            .key(&keys.lock)
            .arg(&lease.token)
            .arg(millis(ttl).max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::from_redis("extend_lock", e))?;
        Ok(extended == 1)
    }

    async fn release(&self, keys: &FlowKeys, lease: &FlowLease) -> Result<bool, StoreError> {
        if !lease.success {
            return Ok(false);
        }
        let mut conn = self.connection();
        let released: i64 = self
            .scripts
            .release
            .key(&keys.lock)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::from_redis("release", e))?;
        Ok(released == 1)
    }

    async fn append_inbox(&self, keys: &FlowKeys, impulse: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.connection();
        conn.rpush::<_, _, ()>(&keys.inbox, impulse)
            .await
            .map_err(|e| StoreError::from_redis("append_inbox", e))
    }

    async fn load_state(&self, keys: &FlowKeys) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection();
        let state: Option<Vec<u8>> = conn
            .get(&keys.state)
            .await
            .map_err(|e| StoreError::from_redis("load_state", e))?;
        Ok(state.filter(|s| !s.is_empty()))
    }
}
