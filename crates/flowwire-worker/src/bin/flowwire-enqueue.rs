// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Push demo impulses into a FlowWire queue.
//!
//! ```bash
//! flowwire-enqueue Counter c-1 Increment 5 --count 10
//! flowwire-enqueue Order order-42 Place '{"sku":"ABC-1","quantity":2}'
//! ```

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowwire_core::codec::SerializerType;
use flowwire_core::{FlowWireConfig, Impulse, ImpulseQueue, LockBackend, RedisStore, codec};

#[derive(Debug, Parser)]
#[command(name = "flowwire-enqueue", about = "Push impulses to a FlowWire queue")]
struct Args {
    /// Registered flow type, e.g. `Order`.
    flow_type: String,

    /// Target flow id.
    flow_id: String,

    /// Impulse name, e.g. `Place`.
    impulse: String,

    /// JSON payload.
    payload: Option<String>,

    /// Queue group. Defaults to FLOWWIRE_QUEUE_GROUP.
    #[arg(long)]
    group: Option<String>,

    /// Number of copies to enqueue.
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Buffer in the flow's inbox instead of the queue.
    #[arg(long)]
    inbox: bool,

    /// Print queue depths after enqueueing.
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("flowwire_core=warn".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = FlowWireConfig::from_env()?;
    if let Some(group) = args.group {
        config.orchestrator.queue_group = group;
    }
    let group = config.orchestrator.queue_group.clone();

    let payload = args
        .payload
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("payload is not valid JSON")?;

    let store = RedisStore::from_config(&config).await?;

    for _ in 0..args.count {
        let mut impulse = Impulse::new(&args.flow_id, &args.flow_type, &args.impulse);
        if let Some(payload) = &payload {
            impulse = impulse.with_payload(payload.clone());
        }

        if args.inbox {
            let keys = store.key_strategy().flow_keys(&args.flow_id);
            let bytes = codec::encode(&impulse, SerializerType::MessagePack)?;
            store.append_inbox(&keys, &bytes).await?;
        } else {
            store.enqueue(&group, &impulse).await?;
        }
        info!(impulse_id = %impulse.id, flow_id = %impulse.flow_id, "Impulse pushed");
    }

    println!(
        "pushed {} x {}/{}:{} to {}",
        args.count,
        args.flow_type,
        args.flow_id,
        args.impulse,
        if args.inbox { "inbox" } else { group.as_str() }
    );

    if args.stats {
        let depths = store.depths(&group).await?;
        println!(
            "pending={} inflight={} dlq={}",
            depths.pending, depths.inflight, depths.dlq
        );
    }
    Ok(())
}
