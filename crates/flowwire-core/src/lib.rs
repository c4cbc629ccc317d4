// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FlowWire Core - Durable Flow Execution Engine
//!
//! This crate runs user-defined state machines ("flows") keyed by a flow id.
//! Each unit of work is a *tick*: an incoming impulse is applied to the flow's
//! persisted state under a distributed lease, and the new state is committed
//! only if the lease is still held.
//!
//! # Architecture
//!
//! ```text
//!   producers
//!       │ enqueue
//!       ▼
//! ┌───────────────────────────┐       ┌──────────────────────────────┐
//! │   Reliable impulse queue  │       │       Lock & state store     │
//! │  pending / inflight / dlq │       │  P:l:<id>  P:s:<id>  inbox   │
//! └─────────────┬─────────────┘       └──────────────▲───────────────┘
//!               │ dequeue_batch                      │ acquire_and_load
//!               ▼                                    │ save_and_release
//! ┌───────────────────────────┐  impulse  ┌──────────┴───────────────┐
//! │       Orchestrator        │──────────►│      FlowExecutor        │
//! │ pump ─► shards ─► acker   │◄──────────│ registry + pools + PRNG  │
//! └─────────────┬─────────────┘  outcome  └──────────────────────────┘
//!               │ ack / nack
//!               ▼
//!        Inflight reaper (returns expired inflight to pending)
//! ```
//!
//! Both store capabilities are traits ([`LockBackend`], [`ImpulseQueue`]) with
//! a Redis implementation ([`RedisStore`]) and an in-process one
//! ([`MemoryStore`]).
//!
//! # Tick outcomes
//!
//! | Outcome | Meaning | Orchestrator action |
//! |---------|---------|---------------------|
//! | `Committed` | State written, lease released | ack |
//! | `LockBusy` | Another worker holds the flow | leave inflight |
//! | `NotEnergized` | Cold circuit flow, impulse cannot start it | ack |
//! | `ConcurrencyFault` | Lease lost before the save | nack (retryable) |
//! | `UnknownFlowType` | No registered flow type | ack |
//! | `Err(_)` | Flow logic, codec or store failure | nack (retryable) |
//!
//! An impulse nacked five times lands in the dead-letter list.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FLOWWIRE_REDIS_URL` | `redis://127.0.0.1:6379/0` | Redis connection URL |
//! | `FLOWWIRE_KEY_PREFIX` | `fw` | Prefix of every store key |
//! | `FLOWWIRE_LOCK_TIMEOUT_MS` | `30000` | Lease TTL |
//! | `FLOWWIRE_HEARTBEAT_INTERVAL_MS` | `10000` | Lease extension interval, below half the TTL |
//! | `FLOWWIRE_FINISHED_FLOW_RETENTION_MS` | `604800000` | State expiry of finished flows, `0` deletes |
//! | `FLOWWIRE_ENABLE_EXECUTION_HISTORY` | `true` | Keep the last 100 applied impulses in the state |
//! | `FLOWWIRE_CONCURRENCY` | CPU count | Shards or polling workers |
//! | `FLOWWIRE_POLL_INTERVAL_MS` | `50` | Sleep after an empty dequeue |
//! | `FLOWWIRE_MAX_INBOX_BATCH_SIZE` | `100` | Inbox items replayed per tick |
//! | `FLOWWIRE_SHUTDOWN_TIMEOUT_MS` | `30000` | Grace period before tasks are aborted |
//! | `FLOWWIRE_VISIBILITY_TIMEOUT_MS` | `30000` | Inflight deadline of a dequeued impulse |
//! | `FLOWWIRE_QUEUE_GROUP` | `default` | Queue group consumed |
//! | `FLOWWIRE_ORCHESTRATOR_MODE` | `sharded` | `sharded` or `polling` |
//! | `FLOWWIRE_MAX_CONCURRENT_FLOWS` | `0` | Concurrent tick limit, `0` is unbounded |
//! | `FLOWWIRE_STATE_SERIALIZER` | `msgpack` | `msgpack`, `compressed` or `json` |
//! | `FLOWWIRE_COMPRESS_INLINE_STATE` | `true` | Compress large MessagePack state |
//! | `FLOWWIRE_COMPRESS_ABOVE_BYTES` | `1024` | Compression threshold |
//!
//! # Modules
//!
//! - [`keys`]: Store key layout
//! - [`codec`]: Tagged wire format (MessagePack, compressed MessagePack, JSON)
//! - [`lock`]: Lease protocol contract
//! - [`queue`]: Reliable queue contract
//! - [`redis_store`], [`memory`]: Store implementations
//! - [`flow`], [`registry`], [`pool`], [`context`], [`state`]: Flow model
//! - [`random`]: Deterministic PRNG
//! - [`executor`]: The tick state machine
//! - [`orchestrator`], [`reaper`], [`lease`]: Background workers
//! - [`runtime`]: Embeddable runtime

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod flow;
pub mod keys;
pub mod lease;
pub mod lock;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod random;
pub mod reaper;
pub mod redis_store;
pub mod registry;
pub mod runtime;
pub mod state;

pub use codec::{CodecError, SerializerType};
pub use config::{ConfigError, FlowWireConfig, OrchestratorMode};
pub use context::{FlowContext, Services};
pub use error::{CoreError, StoreError};
pub use executor::{FlowExecutor, TickExecutor, TickOutcome};
pub use flow::{Flow, FlowDefinition, FlowError, FlowInstance};
pub use keys::{FlowKeys, KeyStrategy, QueueKeys};
pub use lease::LeaseKeeper;
pub use lock::{LoadedFlow, LockBackend, StateRetention};
pub use memory::MemoryStore;
pub use model::{FlowCommand, FlowLease, FlowMode, Impulse};
pub use orchestrator::{PollingOrchestrator, ShardedOrchestrator};
pub use queue::{ImpulseQueue, NackOutcome, QueueDepths};
pub use random::{DeterministicRng, RngState};
pub use reaper::InflightReaper;
pub use redis_store::RedisStore;
pub use registry::{FlowMetadata, FlowRegistry};
pub use runtime::FlowWireRuntime;
