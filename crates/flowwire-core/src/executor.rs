// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow executor.
//!
//! One call to [`TickExecutor::execute_tick`] runs one tick of one flow:
//!
//! ```text
//! Idle ─► LockAttempted ─┬─► LockBusy
//!                        └─► Loaded ─┬─► NotEnergized (lock released)
//!                                    └─► Hydrated ─► Executed ─┬─► Committed
//!                                                              └─► ConcurrencyFault
//! ```
//!
//! The executor never acks or nacks; it reports a [`TickOutcome`] and leaves
//! that decision to the orchestrator.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::FlowWireConfig;
use crate::context::Services;
use crate::error::{CoreError, Result};
use crate::flow::FlowError;
use crate::keys::{FlowKeys, KeyStrategy};
use crate::lock::{LoadedFlow, LockBackend, StateRetention};
use crate::model::{FlowCommand, FlowLease, Impulse, new_fence_token};
use crate::pool::FlowPools;
use crate::random::{DeterministicRng, RngState};
use crate::registry::{FlowMetadata, FlowRegistry};
use crate::state::{HistoryEntry, StatePolicy, TickHeader};

/// Flow ids whose keys are kept resolved.
pub const KEY_CACHE_CAPACITY: usize = 10_000;

/// How a tick ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// New state written, lock released.
    Committed {
        command: FlowCommand,
        elapsed: Duration,
    },
    /// Another worker holds the flow. Nothing happened.
    LockBusy,
    /// Cold circuit flow and the impulse cannot start it. Nothing was written.
    NotEnergized,
    /// The lease was lost before the save. The computed state was discarded.
    ConcurrencyFault,
    /// No registered flow type matches the impulse.
    UnknownFlowType,
}

impl TickOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed { .. } => "committed",
            Self::LockBusy => "lock_busy",
            Self::NotEnergized => "not_energized",
            Self::ConcurrencyFault => "concurrency_fault",
            Self::UnknownFlowType => "unknown_flow_type",
        }
    }
}

/// Runs ticks. Orchestrators depend on this rather than on [`FlowExecutor`].
#[async_trait]
pub trait TickExecutor: Send + Sync {
    async fn execute_tick(&self, impulse: &Impulse) -> Result<TickOutcome>;
}

/// Result of the synchronous part of a tick.
struct Computed {
    state: Vec<u8>,
    command: FlowCommand,
    tick: u64,
}

/// The production [`TickExecutor`].
pub struct FlowExecutor {
    lock: Arc<dyn LockBackend>,
    registry: Arc<FlowRegistry>,
    pools: FlowPools,
    services: Option<Arc<Services>>,
    keys: KeyStrategy,
    key_cache: DashMap<String, Arc<FlowKeys>>,
    policy: StatePolicy,
    lock_timeout: Duration,
    max_inbox: usize,
    record_history: bool,
    finished_retention: Duration,
}

impl std::fmt::Debug for FlowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowExecutor")
            .field("flow_types", &self.registry.len())
            .field("lock_timeout", &self.lock_timeout)
            .field("max_inbox", &self.max_inbox)
            .field("policy", &self.policy)
            .finish()
    }
}

impl FlowExecutor {
    pub fn new(
        config: &FlowWireConfig,
        lock: Arc<dyn LockBackend>,
        registry: Arc<FlowRegistry>,
    ) -> Self {
        let pools = FlowPools::new(&registry);
        Self {
            lock,
            pools,
            registry,
            services: None,
            keys: config.key_strategy(),
            key_cache: DashMap::new(),
            policy: StatePolicy::from_config(config),
            lock_timeout: config.execution.lock_timeout,
            max_inbox: config.orchestrator.max_inbox_batch_size,
            record_history: config.execution.enable_execution_history,
            finished_retention: config.execution.finished_flow_retention,
        }
    }

    /// Services every flow context can resolve.
    pub fn with_services(mut self, services: Arc<Services>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn pools(&self) -> &FlowPools {
        &self.pools
    }

    /// Resolved keys of a flow, cached.
    pub fn flow_keys(&self, flow_id: &str) -> Arc<FlowKeys> {
        if let Some(keys) = self.key_cache.get(flow_id) {
            return keys.clone();
        }
        if self.key_cache.len() >= KEY_CACHE_CAPACITY {
            self.key_cache.clear();
        }
        let keys = Arc::new(self.keys.flow_keys(flow_id));
        self.key_cache.insert(flow_id.to_string(), keys.clone());
        keys
    }

    async fn release_quietly(&self, keys: &FlowKeys, lease: &FlowLease) {
        match self.lock.release(keys, lease).await {
            Ok(true) => {}
            Ok(false) => debug!(flow_id = %lease.flow_id, "Lease already gone at release"),
            Err(e) => warn!(
                flow_id = %lease.flow_id,
                error = %e,
                "Failed to release lease, it will expire"
            ),
        }
    }

    /// Everything between load and save. Pooled objects never outlive this call.
    fn compute(
        &self,
        meta: &FlowMetadata,
        impulse: &Impulse,
        loaded: LoadedFlow,
        now: DateTime<Utc>,
    ) -> Result<Option<Computed>> {
        let Some(mut flow) = self.pools.checkout(meta) else {
            return Ok(None);
        };
        let processing = |source: FlowError| CoreError::Processing {
            flow_id: impulse.flow_id.clone(),
            source,
        };

        let mut header = match flow.hydrate(loaded.state.as_deref())? {
            Some(header) => header,
            None => TickHeader {
                rng: cold_seed(&impulse.flow_id, now),
                ..TickHeader::default()
            },
        };

        let ctx = flow
            .context_mut()
            .ok_or_else(|| processing(FlowError::MissingContext))?;
        ctx.prepare(
            &impulse.flow_id,
            now,
            header.tick,
            &impulse.id,
            header.rng,
            self.services.clone(),
        );

        let buffered: Vec<Impulse> = loaded
            .inbox
            .iter()
            .filter_map(|bytes| match codec::decode::<Impulse>(bytes) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(
                        flow_id = %impulse.flow_id,
                        error = %e,
                        "Skipping undecodable inbox entry"
                    );
                    None
                }
            })
            .collect();

        for signal in buffered.iter().chain(std::iter::once(impulse)) {
            flow.dispatch_signal(&signal.name, signal.payload.as_ref())
                .map_err(processing)?;
            if self.record_history {
                header.record(HistoryEntry {
                    tick: header.tick,
                    impulse_id: signal.id.clone(),
                    impulse_name: signal.name.clone(),
                    at: now,
                });
            }
        }

        let command = flow.execute().map_err(processing)?;

        if let Some(ctx) = flow.context_mut() {
            header.rng = ctx.rng_state();
        }
        header.tick += 1;

        let state = flow.persist(&header, &self.policy)?;
        Ok(Some(Computed {
            state,
            command,
            tick: header.tick,
        }))
    }

    async fn commit(
        &self,
        meta: &FlowMetadata,
        keys: &FlowKeys,
        lease: &FlowLease,
        impulse: &Impulse,
        loaded: LoadedFlow,
        started: Instant,
    ) -> Result<TickOutcome> {
        // A panicking flow fails this tick only. The checkout returns its
        // objects to the pools while unwinding.
        let computed = panic::catch_unwind(AssertUnwindSafe(|| {
            self.compute(meta, impulse, loaded, Utc::now())
        }))
        .unwrap_or_else(|payload| {
            Err(CoreError::Processing {
                flow_id: impulse.flow_id.clone(),
                source: FlowError::from_panic(payload.as_ref()),
            })
        });
        let Some(computed) = computed? else {
            self.release_quietly(keys, lease).await;
            return Ok(TickOutcome::UnknownFlowType);
        };

        let retention = if computed.command.is_terminal() {
            StateRetention::finished(self.finished_retention)
        } else {
            StateRetention::Keep
        };

        if !self
            .lock
            .save_and_release(keys, lease, &computed.state, retention)
            .await?
        {
            warn!(
                flow_id = %impulse.flow_id,
                flow_type = %meta.flow_type(),
                impulse_id = %impulse.id,
                "Lease lost before save, tick discarded"
            );
            return Ok(TickOutcome::ConcurrencyFault);
        }

        let elapsed = started.elapsed();
        info!(
            flow_id = %impulse.flow_id,
            flow_type = %meta.flow_type(),
            impulse = %impulse.name,
            tick = computed.tick,
            command = computed.command.kind(),
            state_bytes = computed.state.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Tick committed"
        );
        Ok(TickOutcome::Committed {
            command: computed.command,
            elapsed,
        })
    }
}

#[async_trait]
impl TickExecutor for FlowExecutor {
    async fn execute_tick(&self, impulse: &Impulse) -> Result<TickOutcome> {
        let Some(meta) = self.registry.get(&impulse.flow_type) else {
            warn!(
                flow_id = %impulse.flow_id,
                flow_type = %impulse.flow_type,
                impulse_id = %impulse.id,
                "No flow type registered for impulse, dropping it"
            );
            return Ok(TickOutcome::UnknownFlowType);
        };

        let started = Instant::now();
        let keys = self.flow_keys(&impulse.flow_id);
        let token = new_fence_token();

        let Some(loaded) = self
            .lock
            .acquire_and_load(&keys, &token, self.lock_timeout, self.max_inbox)
            .await?
        else {
            info!(
                flow_id = %impulse.flow_id,
                flow_type = %meta.flow_type(),
                "Flow is locked by another worker"
            );
            return Ok(TickOutcome::LockBusy);
        };
        let lease = FlowLease::granted(impulse.flow_id.as_str(), token);

        if loaded.state.is_none() && !meta.admits_cold(&impulse.name) {
            warn!(
                flow_id = %impulse.flow_id,
                flow_type = %meta.flow_type(),
                impulse = %impulse.name,
                dropped_inbox = loaded.inbox.len(),
                "Impulse cannot energize a cold circuit flow"
            );
            self.release_quietly(&keys, &lease).await;
            return Ok(TickOutcome::NotEnergized);
        }

        match self
            .commit(&meta, &keys, &lease, impulse, loaded, started)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(
                    flow_id = %impulse.flow_id,
                    flow_type = %meta.flow_type(),
                    impulse_id = %impulse.id,
                    error_code = e.error_code(),
                    error = %e,
                    "Tick failed"
                );
                self.release_quietly(&keys, &lease).await;
                Err(e)
            }
        }
    }
}

/// RNG position for the first tick of a flow: `sha256(flow_id) ^ now_ms`.
fn cold_seed(flow_id: &str, now: DateTime<Utc>) -> RngState {
    let digest = Sha256::digest(flow_id.as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    let seed = u64::from_le_bytes(word) ^ now.timestamp_millis() as u64;
    DeterministicRng::new(seed).export_state()
}
