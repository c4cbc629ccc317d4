// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed lock and lease protocol.
//!
//! A tick is bracketed by two atomic store operations:
//!
//! 1. **acquire-and-load**: set the lock key to a fresh fence token if it is
//!    absent (with a TTL), and in the same round trip read the state blob and
//!    pop up to N buffered inbox items.
//! 2. **save-and-release**: only if the lock key still holds the same token,
//!    write the new state and delete the lock.
//!
//! A worker whose lease expired and was taken over cannot commit: its token no
//! longer matches.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::keys::FlowKeys;
use crate::model::FlowLease;

/// What acquire-and-load returns when the lock was granted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedFlow {
    /// Persisted state, `None` for a cold flow.
    pub state: Option<Vec<u8>>,
    /// Encoded impulses popped from the inbox, oldest first.
    pub inbox: Vec<Vec<u8>>,
}

/// What save-and-release does with the state key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateRetention {
    /// Keep the state without expiry.
    #[default]
    Keep,
    /// Delete the state key.
    Delete,
    /// Keep the state for a limited time.
    Expire(Duration),
}

impl StateRetention {
    /// Retention for a finished flow.
    pub fn finished(retention: Duration) -> Self {
        if retention.is_zero() {
            Self::Delete
        } else {
            Self::Expire(retention)
        }
    }

    /// Wire form used by the save script: `-1` keep, `0` delete, `>0` expiry in ms.
    pub fn as_millis_arg(self) -> i64 {
        match self {
            Self::Keep => -1,
            Self::Delete => 0,
            Self::Expire(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX).max(1),
        }
    }
}

/// Store operations guarding flow state.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take the lock with `token` and load state plus up to `max_inbox` inbox items.
    ///
    /// Returns `Ok(None)` when someone else holds the lock.
    async fn acquire_and_load(
        &self,
        keys: &FlowKeys,
        token: &str,
        ttl: Duration,
        max_inbox: usize,
    ) -> Result<Option<LoadedFlow>, StoreError>;

    /// Write `state` and drop the lock, only if the lock still holds the lease token.
    ///
    /// Returns `false` on a fence mismatch, in which case nothing was written.
    async fn save_and_release(
        &self,
        keys: &FlowKeys,
        lease: &FlowLease,
        state: &[u8],
        retention: StateRetention,
    ) -> Result<bool, StoreError>;

    /// Push the lock expiry out to `ttl` from now if the lease still holds it.
    async fn extend(
        &self,
        keys: &FlowKeys,
        lease: &FlowLease,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Drop the lock without writing state, if the lease still holds it.
    async fn release(&self, keys: &FlowKeys, lease: &FlowLease) -> Result<bool, StoreError>;

    /// Buffer an encoded impulse in the flow's inbox.
    async fn append_inbox(&self, keys: &FlowKeys, impulse: &[u8]) -> Result<(), StoreError>;

    /// Read the state blob without taking the lock.
    async fn load_state(&self, keys: &FlowKeys) -> Result<Option<Vec<u8>>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_args() {
        assert_eq!(StateRetention::Keep.as_millis_arg(), -1);
        assert_eq!(StateRetention::Delete.as_millis_arg(), 0);
        assert_eq!(
            StateRetention::Expire(Duration::from_secs(2)).as_millis_arg(),
            2000
        );
        assert_eq!(
            StateRetention::Expire(Duration::from_micros(10)).as_millis_arg(),
            1
        );
    }

    #[test]
    fn test_finished_retention() {
        assert_eq!(
            StateRetention::finished(Duration::ZERO),
            StateRetention::Delete
        );
        assert_eq!(
            StateRetention::finished(Duration::from_secs(5)),
            StateRetention::Expire(Duration::from_secs(5))
        );
    }
}
