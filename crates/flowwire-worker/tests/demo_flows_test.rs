// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Demo flows driven through a full runtime on the in-process store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use flowwire_core::codec;
use flowwire_core::state::StateEnvelope;
use flowwire_core::{
    FlowWireConfig, FlowWireRuntime, Impulse, ImpulseQueue, KeyStrategy, LockBackend, MemoryStore,
    TickExecutor, TickOutcome,
};
use flowwire_worker::demo_registry;
use flowwire_worker::flows::{CounterState, OrderState, OrderStatus};

fn config() -> FlowWireConfig {
    FlowWireConfig::default()
        .with_concurrency(2)
        .with_poll_interval(Duration::from_millis(5))
        .with_heartbeat_interval(Duration::from_secs(1))
        .with_queue_group("demo")
}

async fn state_of<S: serde::de::DeserializeOwned>(store: &MemoryStore, flow_id: &str) -> Option<S> {
    let keys = store.key_strategy().flow_keys(flow_id);
    let bytes = store.load_state(&keys).await.unwrap()?;
    codec::decode::<StateEnvelope<S>>(&bytes)
        .unwrap()
        .map(|envelope| envelope.state)
}

async fn drain(store: &MemoryStore) {
    for _ in 0..500 {
        if store.depths("demo").await.unwrap().is_drained() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("demo queue not drained");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_order_lifecycle_through_runtime() {
    let store = Arc::new(MemoryStore::new(KeyStrategy::default(), Duration::from_secs(30)));
    let runtime = FlowWireRuntime::builder()
        .config(config())
        .store(store.clone())
        .registry(Arc::new(demo_registry()))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let steps = [
        Impulse::new("order-1", "Order", "Place").with_payload(json!({ "sku": "ABC-1", "quantity": 2 })),
        Impulse::new("order-1", "Order", "Pay").with_payload(json!({ "amount_cents": 2400 })),
        Impulse::new("order-1", "Order", "Ship"),
    ];
    for step in &steps {
        store.enqueue("demo", step).await.unwrap();
        drain(&store).await;
    }

    // Never placed, so it cannot start.
    store
        .enqueue("demo", &Impulse::new("order-2", "Order", "Pay"))
        .await
        .unwrap();
    for n in 1..=3 {
        store
            .enqueue(
                "demo",
                &Impulse::new("counter-1", "Counter", "Increment").with_payload(json!(n)),
            )
            .await
            .unwrap();
    }
    drain(&store).await;
    runtime.shutdown().await.unwrap();

    let order: OrderState = state_of(&store, "order-1").await.unwrap();
    assert_eq!(order.status, OrderStatus::Shipped);
    assert_eq!(order.paid_cents, 2400);
    assert!(order.tracking_number.is_some());

    assert!(state_of::<OrderState>(&store, "order-2").await.is_none());

    let counter: CounterState = state_of(&store, "counter-1").await.unwrap();
    assert_eq!(counter.total, 6);
    assert_eq!(counter.updates, 3);
    assert_eq!(store.depths("demo").await.unwrap().dlq, 0);
}

#[tokio::test]
async fn test_cold_order_needs_place() {
    let store = Arc::new(MemoryStore::default());
    let executor = flowwire_core::FlowExecutor::new(
        &FlowWireConfig::default(),
        store.clone(),
        Arc::new(demo_registry()),
    );

    let outcome = executor
        .execute_tick(&Impulse::new("order-9", "Order", "Ship"))
        .await
        .unwrap();
    assert_eq!(outcome, TickOutcome::NotEnergized);

    let outcome = executor
        .execute_tick(
            &Impulse::new("order-9", "Order", "Place")
                .with_payload(json!({ "sku": "Z", "quantity": 1 })),
        )
        .await
        .unwrap();
    assert!(outcome.is_committed());
}
