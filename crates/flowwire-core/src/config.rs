// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! Every option has a default, so an empty environment yields a working
//! single-node configuration against a local Redis. Durations are read as
//! milliseconds.

use std::str::FromStr;
use std::time::Duration;

use crate::codec::SerializerType;
use crate::keys::KeyStrategy;

/// Which orchestrator the runtime starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrchestratorMode {
    /// Ingestion pump, hash-routed shard workers and a batching acker.
    #[default]
    Sharded,
    /// Independent workers each dequeuing single impulses.
    Polling,
}

impl FromStr for OrchestratorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sharded" => Ok(Self::Sharded),
            "polling" | "naive" => Ok(Self::Polling),
            other => Err(format!("unknown orchestrator mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for OrchestratorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sharded => write!(f, "sharded"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

/// Store connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// Redis connection URL
    pub redis_url: String,
    /// Prefix of every key the engine writes
    pub key_prefix: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: "fw".to_string(),
        }
    }
}

/// Tick execution settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOptions {
    /// Lease TTL. A tick must finish well within it.
    pub lock_timeout: Duration,
    /// Lease extension period for long ticks. Must stay below half the lock timeout.
    pub heartbeat_interval: Duration,
    /// How long state of a completed or failed flow is kept. Zero deletes it.
    pub finished_flow_retention: Duration,
    /// Keep the last impulses applied to each flow inside its state envelope.
    pub enable_execution_history: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            finished_flow_retention: Duration::from_secs(7 * 24 * 60 * 60),
            enable_execution_history: true,
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorOptions {
    /// Shard count (sharded) or worker count (polling)
    pub concurrency: usize,
    /// Sleep between empty dequeues
    pub poll_interval: Duration,
    /// Upper bound for inbox items replayed per tick and impulses pulled per batch
    pub max_inbox_batch_size: usize,
    /// Grace period for background tasks on shutdown
    pub shutdown_timeout: Duration,
    /// How long a popped impulse stays hidden before the reaper returns it
    pub visibility_timeout: Duration,
    /// Queue group consumed by this process
    pub queue_group: String,
    pub mode: OrchestratorMode,
    /// Bound on ticks executing at once across all workers. Zero means unbounded.
    pub max_concurrent_flows: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            poll_interval: Duration::from_millis(50),
            max_inbox_batch_size: 100,
            shutdown_timeout: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(30),
            queue_group: "default".to_string(),
            mode: OrchestratorMode::Sharded,
            max_concurrent_flows: 0,
        }
    }
}

/// Codec choice for persisted state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SerializationOptions {
    pub state_serializer: SerializerType,
}

/// Inline storage settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageOptions {
    /// Compress MessagePack state above the threshold
    pub compress_inline_state: bool,
    /// Encoded size above which state is compressed
    pub compress_above_bytes: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            compress_inline_state: true,
            compress_above_bytes: 1024,
        }
    }
}

/// FlowWire configuration
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlowWireConfig {
    pub connection: ConnectionOptions,
    pub execution: ExecutionOptions,
    pub orchestrator: OrchestratorOptions,
    pub serialization: SerializationOptions,
    pub storage: StorageOptions,
}

impl FlowWireConfig {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional; see the crate docs for the full table.
    /// The result is validated before it is returned.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let connection = ConnectionOptions {
            redis_url: env_string("FLOWWIRE_REDIS_URL", defaults.connection.redis_url),
            key_prefix: env_string("FLOWWIRE_KEY_PREFIX", defaults.connection.key_prefix),
        };

        let execution = ExecutionOptions {
            lock_timeout: env_millis("FLOWWIRE_LOCK_TIMEOUT_MS", defaults.execution.lock_timeout)?,
            heartbeat_interval: env_millis(
                "FLOWWIRE_HEARTBEAT_INTERVAL_MS",
                defaults.execution.heartbeat_interval,
            )?,
            finished_flow_retention: env_millis(
                "FLOWWIRE_FINISHED_FLOW_RETENTION_MS",
                defaults.execution.finished_flow_retention,
            )?,
            enable_execution_history: env_bool(
                "FLOWWIRE_ENABLE_EXECUTION_HISTORY",
                defaults.execution.enable_execution_history,
            )?,
        };

        let orchestrator = OrchestratorOptions {
            concurrency: env_parse("FLOWWIRE_CONCURRENCY", defaults.orchestrator.concurrency)?,
            poll_interval: env_millis(
                "FLOWWIRE_POLL_INTERVAL_MS",
                defaults.orchestrator.poll_interval,
            )?,
            max_inbox_batch_size: env_parse(
                "FLOWWIRE_MAX_INBOX_BATCH_SIZE",
                defaults.orchestrator.max_inbox_batch_size,
            )?,
            shutdown_timeout: env_millis(
                "FLOWWIRE_SHUTDOWN_TIMEOUT_MS",
                defaults.orchestrator.shutdown_timeout,
            )?,
            visibility_timeout: env_millis(
                "FLOWWIRE_VISIBILITY_TIMEOUT_MS",
                defaults.orchestrator.visibility_timeout,
            )?,
            queue_group: env_string("FLOWWIRE_QUEUE_GROUP", defaults.orchestrator.queue_group),
            mode: env_parse("FLOWWIRE_ORCHESTRATOR_MODE", defaults.orchestrator.mode)?,
            max_concurrent_flows: env_parse(
                "FLOWWIRE_MAX_CONCURRENT_FLOWS",
                defaults.orchestrator.max_concurrent_flows,
            )?,
        };

        let serialization = SerializationOptions {
            state_serializer: env_parse(
                "FLOWWIRE_STATE_SERIALIZER",
                defaults.serialization.state_serializer,
            )?,
        };

        let storage = StorageOptions {
            compress_inline_state: env_bool(
                "FLOWWIRE_COMPRESS_INLINE_STATE",
                defaults.storage.compress_inline_state,
            )?,
            compress_above_bytes: env_parse(
                "FLOWWIRE_COMPRESS_ABOVE_BYTES",
                defaults.storage.compress_above_bytes,
            )?,
        };

        let config = Self {
            connection,
            execution,
            orchestrator,
            serialization,
            storage,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.key_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "key_prefix",
                "must not be empty".to_string(),
            ));
        }
        if self.orchestrator.queue_group.is_empty() {
            return Err(ConfigError::Invalid(
                "queue_group",
                "must not be empty".to_string(),
            ));
        }
        if self.orchestrator.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency",
                "must be at least 1".to_string(),
            ));
        }
        if self.orchestrator.max_inbox_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "max_inbox_batch_size",
                "must be at least 1".to_string(),
            ));
        }
        if self.execution.lock_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "lock_timeout",
                "must be greater than zero".to_string(),
            ));
        }
        if self.execution.heartbeat_interval >= self.execution.lock_timeout / 2 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval",
                format!(
                    "{:?} must be below half the lock timeout ({:?})",
                    self.execution.heartbeat_interval, self.execution.lock_timeout
                ),
            ));
        }
        Ok(())
    }

    /// Key builder for the configured prefix.
    pub fn key_strategy(&self) -> KeyStrategy {
        KeyStrategy::new(self.connection.key_prefix.clone())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.connection.redis_url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.connection.key_prefix = prefix.into();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.execution.lock_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.execution.heartbeat_interval = interval;
        self
    }

    pub fn with_finished_flow_retention(mut self, retention: Duration) -> Self {
        self.execution.finished_flow_retention = retention;
        self
    }

    pub fn with_execution_history(mut self, enabled: bool) -> Self {
        self.execution.enable_execution_history = enabled;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.orchestrator.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.orchestrator.poll_interval = interval;
        self
    }

    pub fn with_max_inbox_batch_size(mut self, size: usize) -> Self {
        self.orchestrator.max_inbox_batch_size = size;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator.shutdown_timeout = timeout;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator.visibility_timeout = timeout;
        self
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.orchestrator.queue_group = group.into();
        self
    }

    pub fn with_mode(mut self, mode: OrchestratorMode) -> Self {
        self.orchestrator.mode = mode;
        self
    }

    pub fn with_max_concurrent_flows(mut self, max: usize) -> Self {
        self.orchestrator.max_concurrent_flows = max;
        self
    }

    pub fn with_state_serializer(mut self, serializer: SerializerType) -> Self {
        self.serialization.state_serializer = serializer;
        self
    }

    pub fn with_inline_compression(mut self, enabled: bool, above_bytes: usize) -> Self {
        self.storage.compress_inline_state = enabled;
        self.storage.compress_above_bytes = above_bytes;
        self
    }
}

fn env_string(name: &'static str, default: String) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

fn env_parse<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(name, e.to_string())),
        _ => Ok(default),
    }
}

fn env_millis(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid(name, "must be a whole number of milliseconds".into())),
        _ => Ok(default),
    }
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(name, "must be true or false".into())),
        },
        _ => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is missing.
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// A setting has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
