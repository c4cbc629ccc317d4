// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FlowWire Worker - runs the demo flows against Redis
//!
//! Reads `FLOWWIRE_*` variables (see the `flowwire_core` docs), connects to
//! the store and processes impulses until Ctrl-C.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowwire_core::{FlowWireConfig, FlowWireRuntime, RedisStore};
use flowwire_worker::demo_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("flowwire_core=info".parse()?),
        )
        .init();

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    let config = FlowWireConfig::from_env()?;

    info!(
        redis_url = %config.connection.redis_url,
        key_prefix = %config.connection.key_prefix,
        group = %config.orchestrator.queue_group,
        mode = %config.orchestrator.mode,
        "Starting FlowWire worker"
    );

    let store = Arc::new(RedisStore::from_config(&config).await?);
    info!("Connected to store");

    let runtime = FlowWireRuntime::builder()
        .config(config)
        .store(store)
        .registry(Arc::new(demo_registry()))
        .build()?
        .start()
        .await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("FlowWire worker shut down");
    Ok(())
}
