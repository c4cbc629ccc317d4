// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-tick execution context and the service lookup it exposes.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::random::{DeterministicRng, RngState};

/// Immutable type map of shared services handed to flows.
///
/// Built once at startup; flows resolve entries by type through
/// [`FlowContext::service`].
#[derive(Clone, Default)]
pub struct Services {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any previous one of the same type.
    pub fn with<T: Any + Send + Sync>(self, service: T) -> Self {
        self.with_arc(Arc::new(service))
    }

    pub fn with_arc<T: Any + Send + Sync>(mut self, service: Arc<T>) -> Self {
        self.entries.insert(TypeId::of::<T>(), service);
        self
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a flow sees while it runs one tick.
///
/// Contexts are pooled; the executor prepares one before lending it to a
/// flow instance and clears it when the tick is over.
#[derive(Debug)]
pub struct FlowContext {
    flow_id: String,
    current_utc: DateTime<Utc>,
    current_tick: u64,
    impulse_id: Option<String>,
    rng: DeterministicRng,
    services: Option<Arc<Services>>,
}

impl Default for FlowContext {
    fn default() -> Self {
        Self {
            flow_id: String::new(),
            current_utc: DateTime::<Utc>::UNIX_EPOCH,
            current_tick: 0,
            impulse_id: None,
            rng: DeterministicRng::new(0),
            services: None,
        }
    }
}

impl FlowContext {
    /// A standalone context, mainly for driving flows in tests.
    pub fn for_flow(flow_id: impl Into<String>) -> Self {
        let mut ctx = Self::default();
        ctx.flow_id = flow_id.into();
        ctx.current_utc = Utc::now();
        ctx
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Wall-clock time captured once at the start of the tick.
    pub fn now(&self) -> DateTime<Utc> {
        self.current_utc
    }

    /// Number of ticks committed before this one.
    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    /// Id of the impulse that triggered the tick.
    pub fn impulse_id(&self) -> Option<&str> {
        self.impulse_id.as_deref()
    }

    /// Deterministic randomness. Replays of the same tick see the same numbers.
    pub fn rng(&mut self) -> &mut DeterministicRng {
        &mut self.rng
    }

    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services.as_ref()?.get::<T>()
    }

    pub(crate) fn prepare(
        &mut self,
        flow_id: &str,
        now: DateTime<Utc>,
        tick: u64,
        impulse_id: &str,
        rng: RngState,
        services: Option<Arc<Services>>,
    ) {
        self.flow_id.clear();
        self.flow_id.push_str(flow_id);
        self.current_utc = now;
        self.current_tick = tick;
        self.impulse_id = Some(impulse_id.to_string());
        self.rng.import_state(rng);
        self.services = services;
    }

    pub(crate) fn rng_state(&self) -> RngState {
        self.rng.export_state()
    }

    /// Zero every field so nothing leaks into the next tenant.
    pub fn clear(&mut self) {
        self.flow_id.clear();
        self.current_utc = DateTime::<Utc>::UNIX_EPOCH;
        self.current_tick = 0;
        self.impulse_id = None;
        self.rng.reset(0);
        self.services = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Clock(u64);

    struct Mailer;

    #[test]
    fn test_services_by_type() {
        let services = Services::new().with(Clock(5)).with(String::from("cfg"));

        assert_eq!(services.len(), 2);
        assert_eq!(services.get::<Clock>().as_deref(), Some(&Clock(5)));
        assert_eq!(services.get::<String>().as_deref().map(String::as_str), Some("cfg"));
        assert!(services.get::<Mailer>().is_none());
    }

    #[test]
    fn test_prepare_and_clear() {
        let services = Arc::new(Services::new().with(Clock(1)));
        let state = DeterministicRng::new(77).export_state();

        let mut ctx = FlowContext::default();
        ctx.prepare("order-1", Utc::now(), 4, "imp-1", state, Some(services));

        assert_eq!(ctx.flow_id(), "order-1");
        assert_eq!(ctx.current_tick(), 4);
        assert_eq!(ctx.impulse_id(), Some("imp-1"));
        assert!(ctx.service::<Clock>().is_some());
        assert_eq!(ctx.rng().next_u64(), DeterministicRng::new(77).next_u64());

        ctx.clear();
        assert_eq!(ctx.flow_id(), "");
        assert_eq!(ctx.current_tick(), 0);
        assert!(ctx.impulse_id().is_none());
        assert!(ctx.service::<Clock>().is_none());
        assert_eq!(ctx.rng_state(), DeterministicRng::new(0).export_state());
    }
}
