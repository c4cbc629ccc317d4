// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime.
//!
//! [`FlowWireRuntime`] wires the executor, the configured orchestrator and the
//! inflight reaper together and runs them inside an existing tokio
//! application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flowwire_core::{FlowRegistry, FlowWireConfig, FlowWireRuntime, RedisStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = FlowWireConfig::from_env()?;
//!     let store = Arc::new(RedisStore::from_config(&config).await?);
//!     let registry = FlowRegistry::builder().register::<MyFlow>().build();
//!
//!     let runtime = FlowWireRuntime::builder()
//!         .config(config)
//!         .store(store)
//!         .registry(Arc::new(registry))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{FlowWireConfig, OrchestratorMode};
use crate::context::Services;
use crate::executor::{FlowExecutor, TickExecutor};
use crate::lock::LockBackend;
use crate::orchestrator::{PollingOrchestrator, ShardedOrchestrator};
use crate::queue::ImpulseQueue;
use crate::reaper::InflightReaper;
use crate::registry::FlowRegistry;

/// Builder for creating a [`FlowWireRuntime`].
#[derive(Default)]
pub struct FlowWireRuntimeBuilder {
    config: FlowWireConfig,
    lock_backend: Option<Arc<dyn LockBackend>>,
    queue: Option<Arc<dyn ImpulseQueue>>,
    registry: Option<Arc<FlowRegistry>>,
    services: Option<Arc<Services>>,
}

impl std::fmt::Debug for FlowWireRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowWireRuntimeBuilder")
            .field("config", &self.config)
            .field("lock_backend", &self.lock_backend.as_ref().map(|_| "..."))
            .field("queue", &self.queue.as_ref().map(|_| "..."))
            .field("registry", &self.registry.as_ref().map(|r| r.len()))
            .field("services", &self.services)
            .finish()
    }
}

impl FlowWireRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default: [`FlowWireConfig::default`].
    pub fn config(mut self, config: FlowWireConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the lock backend (required).
    pub fn lock_backend(mut self, lock_backend: Arc<dyn LockBackend>) -> Self {
        self.lock_backend = Some(lock_backend);
        self
    }

    /// Set the impulse queue (required).
    pub fn queue(mut self, queue: Arc<dyn ImpulseQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Use one store as both lock backend and queue.
    pub fn store<S>(self, store: Arc<S>) -> Self
    where
        S: LockBackend + ImpulseQueue + 'static,
    {
        let queue: Arc<dyn ImpulseQueue> = store.clone();
        self.lock_backend(store).queue(queue)
    }

    /// Set the flow registry (required).
    pub fn registry(mut self, registry: Arc<FlowRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn services(mut self, services: Arc<Services>) -> Self {
        self.services = Some(services);
        self
    }

    /// Validate the configuration and check required parts are present.
    pub fn build(self) -> Result<FlowWireRuntimeConfig> {
        self.config.validate()?;

        let lock_backend = self
            .lock_backend
            .ok_or_else(|| anyhow::anyhow!("lock backend is required"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;

        if registry.is_empty() {
            warn!("Flow registry is empty, every impulse will be dropped");
        }

        Ok(FlowWireRuntimeConfig {
            config: self.config,
            lock_backend,
            queue,
            registry,
            services: self.services,
        })
    }
}

/// Validated parts of a [`FlowWireRuntime`], ready to start.
pub struct FlowWireRuntimeConfig {
    config: FlowWireConfig,
    lock_backend: Arc<dyn LockBackend>,
    queue: Arc<dyn ImpulseQueue>,
    registry: Arc<FlowRegistry>,
    services: Option<Arc<Services>>,
}

impl std::fmt::Debug for FlowWireRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowWireRuntimeConfig")
            .field("config", &self.config)
            .field("lock_backend", &"...")
            .field("queue", &"...")
            .field("flow_types", &self.registry.len())
            .finish()
    }
}

impl FlowWireRuntimeConfig {
    pub fn config(&self) -> &FlowWireConfig {
        &self.config
    }

    /// Spawn the orchestrator and the reaper.
    pub async fn start(self) -> Result<FlowWireRuntime> {
        let mut executor = FlowExecutor::new(&self.config, self.lock_backend, self.registry);
        if let Some(services) = self.services {
            executor = executor.with_services(services);
        }
        let executor = Arc::new(executor);
        let tick_executor: Arc<dyn TickExecutor> = executor.clone();

        let shutdown = CancellationToken::new();
        let orchestrator = &self.config.orchestrator;

        let orchestrator_handle = match orchestrator.mode {
            OrchestratorMode::Sharded => tokio::spawn(
                ShardedOrchestrator::new(&self.config, self.queue.clone(), tick_executor)
                    .run(shutdown.clone()),
            ),
            OrchestratorMode::Polling => tokio::spawn(
                PollingOrchestrator::new(&self.config, self.queue.clone(), tick_executor)
                    .run(shutdown.clone()),
            ),
        };
        let reaper = InflightReaper::new(&self.config, self.queue.clone());
        let reaper_handle = tokio::spawn(reaper.run(shutdown.clone()));

        info!(
            mode = %orchestrator.mode,
            concurrency = orchestrator.concurrency,
            group = %orchestrator.queue_group,
            flow_types = executor.registry().len(),
            "FlowWire runtime started"
        );

        Ok(FlowWireRuntime {
            config: self.config,
            executor,
            queue: self.queue,
            shutdown,
            tasks: vec![orchestrator_handle, reaper_handle],
        })
    }
}

/// A running FlowWire worker embedded in an application.
///
/// The runtime manages:
/// - the orchestrator pulling impulses and running ticks
/// - the reaper returning expired inflight impulses to pending
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FlowWireRuntime {
    config: FlowWireConfig,
    executor: Arc<FlowExecutor>,
    queue: Arc<dyn ImpulseQueue>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for FlowWireRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowWireRuntime")
            .field("mode", &self.config.orchestrator.mode)
            .field("running", &self.is_running())
            .finish()
    }
}

impl FlowWireRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FlowWireRuntimeBuilder {
        FlowWireRuntimeBuilder::new()
    }

    pub fn config(&self) -> &FlowWireConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<FlowExecutor> {
        &self.executor
    }

    pub fn queue(&self) -> &Arc<dyn ImpulseQueue> {
        &self.queue
    }

    /// Token cancelled at shutdown. Child tokens stop with the runtime.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Stop pulling work, let in-progress ticks and acks drain, and wait up to
    /// the configured shutdown timeout before aborting what is left.
    pub async fn shutdown(self) -> Result<()> {
        info!("FlowWire runtime shutting down...");
        self.shutdown.cancel();

        let mut tasks = self.tasks;
        let timeout = self.config.orchestrator.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            for task in tasks.iter_mut() {
                if let Err(e) = task.await {
                    error!(error = %e, "Runtime task panicked");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Shutdown timed out, aborting remaining tasks"
            );
            for task in &tasks {
                task.abort();
            }
        }
        info!("FlowWire runtime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && self.tasks.iter().all(|t| !t.is_finished())
    }
}
