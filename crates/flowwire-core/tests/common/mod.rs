// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flowwire-core integration tests.
//!
//! Provides test flows, store setup, log capture and state inspection helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowwire_core::codec;
use flowwire_core::state::StateEnvelope;
use flowwire_core::{
    FlowCommand, FlowContext, FlowDefinition, FlowError, FlowExecutor, FlowKeys, FlowRegistry,
    FlowWireConfig, ImpulseQueue, KeyStrategy, LockBackend, MemoryStore, RedisStore,
};

/// Greeting injected through services.
#[derive(Debug)]
pub struct Greeting(pub String);

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
    pub count: i64,
    pub seen: Vec<String>,
    pub rolls: Vec<u64>,
    pub done: bool,
}

/// Memory-mode flow exercising every executor path.
///
/// Signals: `Add(n)`, `Note(text)`, `Roll`, `Greet`, `Finish`, `Abort`, `Boom`, `Panic`.
#[derive(Default)]
pub struct Counter {
    state: CounterState,
    failed: Option<String>,
}

impl flowwire_core::Flow for Counter {
    type State = CounterState;

    fn definition() -> FlowDefinition {
        FlowDefinition::memory("Counter").with_full_name("tests.flows.Counter")
    }

    fn set_state(&mut self, state: CounterState) {
        self.state = state;
    }

    fn state(&self) -> &CounterState {
        &self.state
    }

    fn dispatch_signal(
        &mut self,
        ctx: &mut FlowContext,
        name: &str,
        payload: Option<&Value>,
    ) -> Result<(), FlowError> {
        match name {
            "Add" => {
                let n: i64 = FlowError::parse_payload(name, payload)?;
                self.state.count += n;
            }
            "Note" => {
                let text: String = FlowError::parse_payload(name, payload)?;
                self.state.seen.push(text);
            }
            "Roll" => {
                let roll = ctx.rng().next_u64();
                self.state.rolls.push(roll);
            }
            "Greet" => {
                let greeting = ctx
                    .service::<Greeting>()
                    .ok_or_else(|| FlowError::Logic("no greeting service".to_string()))?;
                self.state.seen.push(greeting.0.clone());
            }
            "Finish" => self.state.done = true,
            "Abort" => self.failed = Some("aborted".to_string()),
            "Boom" => return Err(FlowError::Logic("boom".to_string())),
            "Panic" => panic!("counter exploded"),
            other => return Err(FlowError::UnknownSignal(other.to_string())),
        }
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut FlowContext) -> Result<FlowCommand, FlowError> {
        if let Some(reason) = self.failed.take() {
            return Ok(FlowCommand::Fail { reason });
        }
        if self.state.done {
            return Ok(FlowCommand::Complete {
                output: Some(Value::from(self.state.count)),
            });
        }
        Ok(FlowCommand::Continue)
    }

    fn reset(&mut self) {
        self.state = CounterState::default();
        self.failed = None;
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub status: String,
    pub events: Vec<String>,
}

/// Circuit-mode flow, energized only by `Place`.
#[derive(Default)]
pub struct Order {
    state: OrderState,
}

impl flowwire_core::Flow for Order {
    type State = OrderState;

    fn definition() -> FlowDefinition {
        FlowDefinition::circuit("Order", ["Place"])
    }

    fn set_state(&mut self, state: OrderState) {
        self.state = state;
    }

    fn state(&self) -> &OrderState {
        &self.state
    }

    fn dispatch_signal(
        &mut self,
        _ctx: &mut FlowContext,
        name: &str,
        _payload: Option<&Value>,
    ) -> Result<(), FlowError> {
        match name {
            "Place" => self.state.status = "placed".to_string(),
            "Ship" => self.state.status = "shipped".to_string(),
            _ => {}
        }
        self.state.events.push(name.to_string());
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut FlowContext) -> Result<FlowCommand, FlowError> {
        Ok(FlowCommand::Continue)
    }
}

pub fn registry() -> Arc<FlowRegistry> {
    Arc::new(
        FlowRegistry::builder()
            .register::<Counter>()
            .register::<Order>()
            .build(),
    )
}

/// Route engine logs to the test harness. `RUST_LOG` widens the filter.
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("flowwire_core=info".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}

/// Configuration tuned for fast tests.
pub fn test_config() -> FlowWireConfig {
    FlowWireConfig::default()
        .with_lock_timeout(Duration::from_secs(5))
        .with_heartbeat_interval(Duration::from_secs(1))
        .with_poll_interval(Duration::from_millis(5))
        .with_concurrency(3)
        .with_queue_group("test")
}

pub fn memory_store(visibility: Duration) -> Arc<MemoryStore> {
    init_test_logging();
    Arc::new(MemoryStore::new(KeyStrategy::default(), visibility))
}

pub fn executor(config: &FlowWireConfig, lock: Arc<dyn LockBackend>) -> FlowExecutor {
    init_test_logging();
    FlowExecutor::new(config, lock, registry())
}

/// Decode the persisted envelope of a flow.
pub async fn load_envelope<S>(lock: &dyn LockBackend, keys: &FlowKeys) -> Option<StateEnvelope<S>>
where
    S: serde::de::DeserializeOwned,
{
    let bytes = lock.load_state(keys).await.expect("load_state failed")?;
    codec::decode(&bytes).expect("state decodes")
}

pub async fn counter_state(lock: &dyn LockBackend, keys: &FlowKeys) -> Option<CounterState> {
    load_envelope::<CounterState>(lock, keys)
        .await
        .map(|envelope| envelope.state)
}

/// Poll until pending and inflight are both empty.
pub async fn wait_until_drained(queue: &dyn ImpulseQueue, group: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let depths = queue.depths(group).await.expect("depths failed");
        if depths.is_drained() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("queue '{}' not drained in time: {:?}", group, depths);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Connect to the Redis at TEST_REDIS_URL under a fresh key prefix.
pub async fn redis_store(visibility: Duration) -> Option<RedisStore> {
    init_test_logging();
    let url = std::env::var("TEST_REDIS_URL").ok()?;
    let prefix = format!("fwtest-{}", uuid::Uuid::new_v4().simple());
    RedisStore::connect(&url, KeyStrategy::new(prefix), visibility)
        .await
        .ok()
}

/// Helper macro to skip tests if TEST_REDIS_URL is not set.
#[macro_export]
macro_rules! skip_if_no_redis {
    () => {
        if std::env::var("TEST_REDIS_URL").is_err() {
            eprintln!("Skipping test: TEST_REDIS_URL not set");
            return;
        }
    };
}
