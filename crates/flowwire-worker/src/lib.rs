// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FlowWire Worker
//!
//! A ready-to-run worker process hosting two demo flows:
//!
//! - [`flows::Counter`]: Memory mode, any impulse creates it.
//! - [`flows::Order`]: Circuit mode, only `Place` creates it.
//!
//! Run the worker, then push impulses with the `flowwire-enqueue` binary:
//!
//! ```bash
//! flowwire-worker
//! flowwire-enqueue Order order-42 Place '{"sku":"ABC-1","quantity":2}'
//! flowwire-enqueue Order order-42 Pay '{"amount_cents":2400}'
//! flowwire-enqueue Order order-42 Ship
//! ```

pub mod flows;

use flowwire_core::FlowRegistry;

/// Registry with every demo flow.
pub fn demo_registry() -> FlowRegistry {
    FlowRegistry::builder()
        .register::<flows::Counter>()
        .register::<flows::Order>()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowwire_core::FlowMode;

    #[test]
    fn test_demo_registry() {
        let registry = demo_registry();
        assert_eq!(registry.len(), 2);

        let counter = registry.get("Counter").unwrap();
        assert_eq!(counter.mode(), FlowMode::Memory);

        let order = registry.get("Order").unwrap();
        assert_eq!(order.mode(), FlowMode::Circuit);
        assert!(order.energize_impulses().contains("Place"));
        assert!(registry.get("flowwire.demo.Order").is_some());
    }
}
