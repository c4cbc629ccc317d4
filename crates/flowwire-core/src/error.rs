// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowwire-core.
//!
//! Expected tick outcomes (lock contention, a cold circuit flow, a lost save
//! race) are not errors; they are variants of
//! [`TickOutcome`](crate::executor::TickOutcome). The types here cover genuine
//! faults, each with a stable code for logs.

use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::flow::FlowError;

/// Result type using CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Faults raised by a store backend.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached or dropped the connection. Transient.
    #[error("store unavailable during '{operation}': {details}")]
    Unavailable {
        /// The operation that failed.
        operation: &'static str,
        /// Error details.
        details: String,
    },

    /// The store answered with something the protocol does not allow.
    #[error("unexpected store reply during '{operation}': {details}")]
    UnexpectedReply {
        /// The operation that failed.
        operation: &'static str,
        /// Error details.
        details: String,
    },
}

impl StoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "STORE_UNAVAILABLE",
            Self::UnexpectedReply { .. } => "STORE_UNEXPECTED_REPLY",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub(crate) fn unexpected(operation: &'static str, details: impl Into<String>) -> Self {
        Self::UnexpectedReply {
            operation,
            details: details.into(),
        }
    }

    /// Classify a Redis client error.
    pub(crate) fn from_redis(operation: &'static str, err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            Self::Unavailable {
                operation,
                details: err.to_string(),
            }
        } else {
            Self::UnexpectedReply {
                operation,
                details: err.to_string(),
            }
        }
    }
}

/// Core errors surfaced by the executor and the runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A store round trip failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// State or an impulse could not be encoded or decoded.
    #[error(transparent)]
    Serialization(#[from] CodecError),

    /// Flow logic failed during a tick.
    #[error("flow '{flow_id}' failed: {source}")]
    Processing {
        /// The flow whose tick failed.
        flow_id: String,
        /// What the flow reported.
        #[source]
        source: FlowError,
    },

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
            Self::Serialization(_) => "SERIALIZATION_FAILURE",
            Self::Processing { .. } => "PROCESSING_FAILURE",
            Self::Config(_) => "INVALID_CONFIG",
        }
    }

    /// Whether the failed operation is worth retrying as is.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
