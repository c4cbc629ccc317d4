// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow type registry.
//!
//! Built once at startup through [`FlowRegistryBuilder`] and read-only from
//! then on, so lookups take no lock. Each type is reachable by its short
//! name, its full name, and its Rust `TypeId`.

use std::any::{TypeId, type_name};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use crate::flow::{Flow, FlowInstance, FlowSlot};
use crate::model::FlowMode;

type InstanceFactory = Arc<dyn Fn() -> Box<dyn FlowInstance> + Send + Sync>;

/// Immutable description of a registered flow type.
pub struct FlowMetadata {
    flow_type: String,
    full_name: String,
    flow_type_id: TypeId,
    state_type: &'static str,
    state_type_id: TypeId,
    mode: FlowMode,
    energize_impulses: HashSet<String>,
    factory: InstanceFactory,
}

impl std::fmt::Debug for FlowMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowMetadata")
            .field("flow_type", &self.flow_type)
            .field("full_name", &self.full_name)
            .field("state_type", &self.state_type)
            .field("mode", &self.mode)
            .field("energize_impulses", &self.energize_impulses)
            .finish()
    }
}

impl FlowMetadata {
    fn of<F: Flow + Default>() -> Self {
        let definition = F::definition();
        let flow_type = definition.name;
        let full_name = definition
            .full_name
            .unwrap_or_else(|| type_name::<F>().to_string());

        let factory_type = flow_type.clone();
        let factory: InstanceFactory =
            Arc::new(move || Box::new(FlowSlot::new(factory_type.clone(), F::default())));

        Self {
            flow_type,
            full_name,
            flow_type_id: TypeId::of::<F>(),
            state_type: type_name::<F::State>(),
            state_type_id: TypeId::of::<F::State>(),
            mode: definition.mode,
            energize_impulses: definition.energize_impulses,
            factory,
        }
    }

    /// Short name, also the pool key.
    pub fn flow_type(&self) -> &str {
        &self.flow_type
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn flow_type_id(&self) -> TypeId {
        self.flow_type_id
    }

    pub fn state_type(&self) -> &'static str {
        self.state_type
    }

    pub fn state_type_id(&self) -> TypeId {
        self.state_type_id
    }

    pub fn mode(&self) -> FlowMode {
        self.mode
    }

    pub fn energize_impulses(&self) -> &HashSet<String> {
        &self.energize_impulses
    }

    /// Whether an impulse named `impulse` may tick this flow while it has no state.
    pub fn admits_cold(&self, impulse: &str) -> bool {
        match self.mode {
            FlowMode::Memory => true,
            FlowMode::Circuit => self.energize_impulses.contains(impulse),
        }
    }

    /// A fresh, unpooled instance.
    pub fn create_instance(&self) -> Box<dyn FlowInstance> {
        (self.factory)()
    }
}

/// Collects flow types before freezing them into a [`FlowRegistry`].
#[derive(Default)]
pub struct FlowRegistryBuilder {
    flows: Vec<Arc<FlowMetadata>>,
}

impl FlowRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a flow type. A name already taken keeps its first registrant.
    pub fn register<F: Flow + Default>(mut self) -> Self {
        self.flows.push(Arc::new(FlowMetadata::of::<F>()));
        self
    }

    pub fn build(self) -> FlowRegistry {
        let mut by_name: HashMap<String, Arc<FlowMetadata>> = HashMap::new();
        let mut by_type: HashMap<TypeId, Arc<FlowMetadata>> = HashMap::new();
        let mut all = Vec::with_capacity(self.flows.len());

        for meta in self.flows {
            let conflict = [meta.flow_type(), meta.full_name()]
                .into_iter()
                .find_map(|name| by_name.get(name).map(|existing| (name, existing.clone())));

            if let Some((name, existing)) = conflict {
                warn!(
                    flow_type = %name,
                    kept = %existing.full_name(),
                    ignored = %meta.full_name(),
                    "Duplicate flow type registration ignored"
                );
                continue;
            }
            if by_type.contains_key(&meta.flow_type_id()) {
                warn!(
                    flow_type = %meta.flow_type(),
                    "Flow type registered twice under different names, keeping the first"
                );
                continue;
            }

            by_name.insert(meta.flow_type().to_string(), meta.clone());
            by_name.insert(meta.full_name().to_string(), meta.clone());
            by_type.insert(meta.flow_type_id(), meta.clone());

            info!(
                flow_type = %meta.flow_type(),
                full_name = %meta.full_name(),
                mode = ?meta.mode(),
                energize = meta.energize_impulses().len(),
                "Registered flow type"
            );
            all.push(meta);
        }

        info!(flow_types = all.len(), "Flow registry built");
        FlowRegistry {
            by_name,
            by_type,
            all,
        }
    }
}

/// Frozen lookup from flow type name or Rust type to its metadata.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    by_name: HashMap<String, Arc<FlowMetadata>>,
    by_type: HashMap<TypeId, Arc<FlowMetadata>>,
    all: Vec<Arc<FlowMetadata>>,
}

impl FlowRegistry {
    pub fn builder() -> FlowRegistryBuilder {
        FlowRegistryBuilder::new()
    }

    /// Look up by short or full name.
    pub fn get(&self, name: &str) -> Option<Arc<FlowMetadata>> {
        self.by_name.get(name).cloned()
    }

    pub fn get_by_type<F: Flow>(&self) -> Option<Arc<FlowMetadata>> {
        self.get_by_type_id(TypeId::of::<F>())
    }

    pub fn get_by_type_id(&self, type_id: TypeId) -> Option<Arc<FlowMetadata>> {
        self.by_type.get(&type_id).cloned()
    }

    /// Every registered type once, in registration order.
    pub fn all_flow_types(&self) -> impl Iterator<Item = &Arc<FlowMetadata>> {
        self.all.iter()
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FlowContext;
    use crate::flow::{FlowDefinition, FlowError};
    use crate::model::FlowCommand;

    macro_rules! unit_flow {
        ($name:ident, $definition:expr) => {
            #[derive(Default)]
            struct $name {
                state: u32,
            }

            impl Flow for $name {
                type State = u32;

                fn definition() -> FlowDefinition {
                    $definition
                }

                fn set_state(&mut self, state: u32) {
                    self.state = state;
                }

                fn state(&self) -> &u32 {
                    &self.state
                }

                fn dispatch_signal(
                    &mut self,
                    _ctx: &mut FlowContext,
                    _name: &str,
                    _payload: Option<&serde_json::Value>,
                ) -> Result<(), FlowError> {
                    self.state += 1;
                    Ok(())
                }

                fn execute(&mut self, _ctx: &mut FlowContext) -> Result<FlowCommand, FlowError> {
                    Ok(FlowCommand::Continue)
                }
            }
        };
    }

    unit_flow!(Counter, FlowDefinition::memory("Counter"));
    unit_flow!(
        Order,
        FlowDefinition::circuit("Order", ["Place"]).with_full_name("shop.flows.Order")
    );
    unit_flow!(OtherCounter, FlowDefinition::memory("Counter"));

    #[test]
    fn test_lookup_by_name_full_name_and_type() {
        let registry = FlowRegistry::builder()
            .register::<Counter>()
            .register::<Order>()
            .build();

        assert_eq!(registry.len(), 2);

        let order = registry.get("Order").unwrap();
        assert_eq!(order.mode(), FlowMode::Circuit);
        assert!(Arc::ptr_eq(
            &order,
            &registry.get("shop.flows.Order").unwrap()
        ));
        assert!(Arc::ptr_eq(&order, &registry.get_by_type::<Order>().unwrap()));
        assert_eq!(order.state_type_id(), TypeId::of::<u32>());
        assert_eq!(order.state_type(), "u32");

        let counter = registry.get("Counter").unwrap();
        assert!(counter.full_name().ends_with("Counter"));
        assert!(registry.get("Missing").is_none());
    }

    #[test]
    fn test_duplicate_name_keeps_first() {
        let registry = FlowRegistry::builder()
            .register::<Counter>()
            .register::<OtherCounter>()
            .build();

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("Counter").unwrap().flow_type_id(),
            TypeId::of::<Counter>()
        );
        assert!(registry.get_by_type::<OtherCounter>().is_none());
    }

    #[test]
    fn test_same_type_twice_is_ignored() {
        let registry = FlowRegistry::builder()
            .register::<Counter>()
            .register::<Counter>()
            .build();
        assert_eq!(registry.all_flow_types().count(), 1);
    }

    #[test]
    fn test_energize_gate() {
        let registry = FlowRegistry::builder()
            .register::<Counter>()
            .register::<Order>()
            .build();

        let order = registry.get("Order").unwrap();
        assert!(order.admits_cold("Place"));
        assert!(!order.admits_cold("Ship"));

        let counter = registry.get("Counter").unwrap();
        assert!(counter.admits_cold("Anything"));
    }

    #[test]
    fn test_factory_builds_instances_of_the_type() {
        let registry = FlowRegistry::builder().register::<Order>().build();
        let instance = registry.get("Order").unwrap().create_instance();
        assert_eq!(instance.flow_type(), "Order");
    }
}
