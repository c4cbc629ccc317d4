// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object pools for flow instances and execution contexts.
//!
//! A tick borrows one flow instance (from the pool of its type) and one
//! context (from the shared pool). [`FlowCheckout`] returns both when it is
//! dropped, on every path out of the tick including panics. Everything is
//! reset before it becomes available again.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::context::FlowContext;
use crate::flow::FlowInstance;
use crate::registry::{FlowMetadata, FlowRegistry};

/// Decides what happens to an item handed back to a pool.
pub trait PoolPolicy<T>: Send + Sync {
    /// Reset `item` for reuse. Returning `false` discards it instead.
    fn recycle(&self, item: &mut T) -> bool;
}

impl<T, F> PoolPolicy<T> for F
where
    F: Fn(&mut T) -> bool + Send + Sync,
{
    fn recycle(&self, item: &mut T) -> bool {
        self(item)
    }
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Free-list pool.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    factory: Factory<T>,
    policy: Box<dyn PoolPolicy<T>>,
    max_idle: usize,
    created: AtomicUsize,
}

impl<T: Send> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle_len())
            .field("max_idle", &self.max_idle)
            .field("created", &self.created())
            .finish()
    }
}

impl<T: Send> Pool<T> {
    pub fn new(
        factory: impl Fn() -> T + Send + Sync + 'static,
        policy: impl PoolPolicy<T> + 'static,
        max_idle: usize,
    ) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            policy: Box::new(policy),
            max_idle,
            created: AtomicUsize::new(0),
        }
    }

    /// An idle item, or a new one when none is idle.
    pub fn get(&self) -> T {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        reused.unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            (self.factory)()
        })
    }

    /// Reset and keep `item`, unless the policy discards it or the pool is full.
    pub fn put(&self, mut item: T) {
        if !self.policy.recycle(&mut item) {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Items built by the factory so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

/// Default number of idle items kept per pool.
pub fn default_max_idle() -> usize {
    num_cpus::get().max(1) * 2
}

/// One instance pool per flow type plus the shared context pool.
///
/// The set of types is fixed at construction, so lookups need no locking.
pub struct FlowPools {
    flows: HashMap<String, Pool<Box<dyn FlowInstance>>>,
    contexts: Pool<Box<FlowContext>>,
}

impl std::fmt::Debug for FlowPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowPools")
            .field("flow_types", &self.flows.len())
            .field("contexts", &self.contexts)
            .finish()
    }
}

impl FlowPools {
    pub fn new(registry: &FlowRegistry) -> Self {
        Self::with_max_idle(registry, default_max_idle())
    }

    pub fn with_max_idle(registry: &FlowRegistry, max_idle: usize) -> Self {
        let flows = registry
            .all_flow_types()
            .map(|meta| {
                let factory_meta = meta.clone();
                let pool = Pool::new(
                    move || factory_meta.create_instance(),
                    |flow: &mut Box<dyn FlowInstance>| {
                        flow.reset();
                        true
                    },
                    max_idle,
                );
                (meta.flow_type().to_string(), pool)
            })
            .collect();

        let contexts = Pool::new(
            || Box::new(FlowContext::default()),
            |ctx: &mut Box<FlowContext>| {
                ctx.clear();
                true
            },
            max_idle,
        );

        Self { flows, contexts }
    }

    /// Borrow an instance of `meta`'s type with a context already lent to it.
    ///
    /// `None` when the type has no pool, which only happens for metadata from
    /// another registry.
    pub fn checkout(&self, meta: &FlowMetadata) -> Option<FlowCheckout<'_>> {
        let pool = self.flows.get(meta.flow_type())?;
        let mut flow = pool.get();
        flow.set_context(self.contexts.get());
        Some(FlowCheckout {
            flow: Some(flow),
            pool,
            contexts: &self.contexts,
        })
    }

    /// Pre-build up to `per_type` idle instances of every type.
    pub fn warm_up(&self, per_type: usize) {
        for pool in self.flows.values() {
            let items: Vec<_> = (0..per_type).map(|_| pool.get()).collect();
            for item in items {
                pool.put(item);
            }
        }
    }

    pub fn flow_pool(&self, flow_type: &str) -> Option<&Pool<Box<dyn FlowInstance>>> {
        self.flows.get(flow_type)
    }

    pub fn context_pool(&self) -> &Pool<Box<FlowContext>> {
        &self.contexts
    }
}

/// A flow instance on loan for one tick.
pub struct FlowCheckout<'a> {
    flow: Option<Box<dyn FlowInstance>>,
    pool: &'a Pool<Box<dyn FlowInstance>>,
    contexts: &'a Pool<Box<FlowContext>>,
}

impl Deref for FlowCheckout<'_> {
    type Target = dyn FlowInstance;

    fn deref(&self) -> &Self::Target {
        // Only emptied in drop.
        match &self.flow {
            Some(flow) => flow.as_ref(),
            None => unreachable!("flow checkout used after drop"),
        }
    }
}

impl DerefMut for FlowCheckout<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.flow {
            Some(flow) => flow.as_mut(),
            None => unreachable!("flow checkout used after drop"),
        }
    }
}

impl Drop for FlowCheckout<'_> {
    fn drop(&mut self) {
        if let Some(mut flow) = self.flow.take() {
            if let Some(ctx) = flow.take_context() {
                self.contexts.put(ctx);
            }
            self.pool.put(flow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Flow, FlowDefinition, FlowError};
    use crate::model::FlowCommand;
    use serde_json::json;

    #[test]
    fn test_pool_reuses_and_resets() {
        let pool = Pool::new(
            Vec::<u32>::new,
            |v: &mut Vec<u32>| {
                v.clear();
                true
            },
            4,
        );

        let mut item = pool.get();
        item.extend([1, 2, 3]);
        pool.put(item);
        assert_eq!(pool.idle_len(), 1);

        let again = pool.get();
        assert!(again.is_empty());
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_policy_can_discard() {
        let pool = Pool::new(|| 0u32, |n: &mut u32| *n < 10, 4);
        pool.put(42);
        assert_eq!(pool.idle_len(), 0);
        pool.put(1);
        assert_eq!(pool.idle_len(), 1);
    }

    #[test]
    fn test_pool_caps_idle_items() {
        let pool = Pool::new(|| (), |_: &mut ()| true, 2);
        for _ in 0..5 {
            pool.put(());
        }
        assert_eq!(pool.idle_len(), 2);
    }

    #[derive(Default)]
    struct Notes {
        state: Vec<String>,
    }

    impl Flow for Notes {
        type State = Vec<String>;

        fn definition() -> FlowDefinition {
            FlowDefinition::memory("Notes")
        }

        fn set_state(&mut self, state: Vec<String>) {
            self.state = state;
        }

        fn state(&self) -> &Vec<String> {
            &self.state
        }

        fn dispatch_signal(
            &mut self,
            ctx: &mut FlowContext,
            name: &str,
            _payload: Option<&serde_json::Value>,
        ) -> Result<(), FlowError> {
            self.state.push(format!("{}:{}", ctx.flow_id(), name));
            Ok(())
        }

        fn execute(&mut self, _ctx: &mut FlowContext) -> Result<FlowCommand, FlowError> {
            Ok(FlowCommand::Continue)
        }
    }

    #[test]
    fn test_checkout_returns_clean_instances() {
        let registry = FlowRegistry::builder().register::<Notes>().build();
        let pools = FlowPools::with_max_idle(&registry, 4);
        let meta = registry.get("Notes").unwrap();

        {
            let mut flow = pools.checkout(&meta).unwrap();
            flow.context_mut().unwrap().prepare(
                "tenant-a",
                chrono::Utc::now(),
                0,
                "i-1",
                Default::default(),
                None,
            );
            flow.dispatch_signal("Secret", None).unwrap();
            assert_eq!(flow.state_json().unwrap(), json!(["tenant-a:Secret"]));
        }

        assert_eq!(pools.flow_pool("Notes").unwrap().idle_len(), 1);
        assert_eq!(pools.context_pool().idle_len(), 1);

        let mut flow = pools.checkout(&meta).unwrap();
        assert_eq!(flow.state_json().unwrap(), json!([]));
        assert_eq!(flow.context_mut().unwrap().flow_id(), "");
        assert_eq!(pools.flow_pool("Notes").unwrap().created(), 1);
    }

    #[test]
    fn test_checkout_is_returned_on_panic() {
        let registry = FlowRegistry::builder().register::<Notes>().build();
        let pools = FlowPools::with_max_idle(&registry, 4);
        let meta = registry.get("Notes").unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _flow = pools.checkout(&meta).unwrap();
            panic!("flow logic blew up");
        }));
        assert!(result.is_err());
        assert_eq!(pools.flow_pool("Notes").unwrap().idle_len(), 1);
        assert_eq!(pools.context_pool().idle_len(), 1);
    }

    #[test]
    fn test_warm_up() {
        let registry = FlowRegistry::builder().register::<Notes>().build();
        let pools = FlowPools::with_max_idle(&registry, 8);
        pools.warm_up(3);
        assert_eq!(pools.flow_pool("Notes").unwrap().idle_len(), 3);
    }
}
