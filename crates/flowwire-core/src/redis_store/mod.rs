// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis/Valkey backend for the lock protocol and the impulse queue.

mod lock;
mod queue;
mod scripts;

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::info;

use crate::config::FlowWireConfig;
use crate::error::StoreError;
use crate::keys::KeyStrategy;

use scripts::Scripts;

/// Production store. Cheap to clone; clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    keys: KeyStrategy,
    visibility_timeout: Duration,
    scripts: Arc<Scripts>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.keys.prefix())
            .field("visibility_timeout", &self.visibility_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager, keys: KeyStrategy, visibility_timeout: Duration) -> Self {
        Self {
            conn,
            keys,
            visibility_timeout,
            scripts: Arc::new(Scripts::load()),
        }
    }

    /// Open a connection manager for `url`.
    ///
    /// The manager reconnects on its own after the initial connection succeeds.
    pub async fn connect(
        url: &str,
        keys: KeyStrategy,
        visibility_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::from_redis("connect", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::from_redis("connect", e))?;

        info!(prefix = %keys.prefix(), "Connected to Redis");
        Ok(Self::new(conn, keys, visibility_timeout))
    }

    /// Connect using the connection, prefix and visibility settings of `config`.
    pub async fn from_config(config: &FlowWireConfig) -> Result<Self, StoreError> {
        Self::connect(
            &config.connection.redis_url,
            config.key_strategy(),
            config.orchestrator.visibility_timeout,
        )
        .await
    }

    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.keys
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
