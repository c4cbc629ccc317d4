// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data shared by every layer: impulses, leases, lifecycle modes and the
//! command a flow emits at the end of a tick.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header recording the reason of the most recent nack.
pub const LAST_ERROR_HEADER: &str = "fw-last-error";

/// Delivery count at which an impulse stops being retried.
pub const MAX_DELIVERY_COUNT: u32 = 5;

/// One signal delivery addressed to a flow.
///
/// `id` is generated once and survives redeliveries. Headers live in a
/// `BTreeMap` and payloads in a `serde_json::Value` (whose maps are ordered),
/// so encoding a decoded impulse reproduces the original bytes. The queue
/// relies on that to find inflight members by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Impulse {
    pub id: String,
    pub flow_id: String,
    pub flow_type: String,
    pub name: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery_count: u32,
}

impl Impulse {
    /// New impulse with a fresh id, stamped now.
    pub fn new(
        flow_id: impl Into<String>,
        flow_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            flow_id: flow_id.into(),
            flow_type: flow_type.into(),
            name: name.into(),
            payload: None,
            headers: BTreeMap::new(),
            received_at: Utc::now(),
            delivery_count: 0,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// The reason recorded by the last nack, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.headers.get(LAST_ERROR_HEADER).map(String::as_str)
    }

    /// Copy of this impulse as it looks after a nack: one more delivery, reason recorded.
    pub fn redelivered(&self, reason: &str) -> Self {
        let mut next = self.clone();
        next.delivery_count = next.delivery_count.saturating_add(1);
        next.headers
            .insert(LAST_ERROR_HEADER.to_string(), reason.to_string());
        next
    }
}

/// Result of a lock attempt.
///
/// The token is the only credential accepted by save-and-release; it is empty
/// when `success` is false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowLease {
    pub flow_id: String,
    pub token: String,
    pub success: bool,
}

impl FlowLease {
    pub fn granted(flow_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            token: token.into(),
            success: true,
        }
    }

    pub fn contended(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            token: String::new(),
            success: false,
        }
    }
}

/// Fresh fence token. Random 128 bits, unique per attempt.
pub fn new_fence_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Lifecycle policy of a flow type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowMode {
    /// Any impulse creates or updates the instance.
    #[default]
    Memory,
    /// A cold instance is only created by one of the type's energize impulses.
    Circuit,
}

/// What a flow asks for at the end of a tick.
///
/// The executor only looks at it to tell finished flows apart; everything else
/// is for the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowCommand {
    /// Nothing to schedule, wait for the next impulse.
    Continue,
    /// Run an operation outside the tick.
    Run {
        operation: String,
        #[serde(default)]
        input: Option<serde_json::Value>,
    },
    /// Wake the flow after a delay.
    WaitTimer { duration: Duration },
    /// Park until a named signal arrives.
    WaitForSignal {
        name: String,
        #[serde(default)]
        timeout: Option<Duration>,
    },
    /// Finished successfully.
    Complete {
        #[serde(default)]
        output: Option<serde_json::Value>,
    },
    /// Finished with a failure.
    Fail { reason: String },
}

impl FlowCommand {
    /// True for `Complete` and `Fail`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Fail { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Run { .. } => "run",
            Self::WaitTimer { .. } => "wait_timer",
            Self::WaitForSignal { .. } => "wait_for_signal",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, SerializerType};
    use serde_json::json;

    #[test]
    fn test_impulse_defaults() {
        let impulse = Impulse::new("order-1", "Order", "Place");
        assert_eq!(impulse.delivery_count, 0);
        assert!(impulse.payload.is_none());
        assert!(impulse.headers.is_empty());
        assert!(Uuid::parse_str(&impulse.id).is_ok());
        assert_ne!(impulse.id, Impulse::new("order-1", "Order", "Place").id);
    }

    #[test]
    fn test_redelivered_bumps_count_and_records_reason() {
        let impulse = Impulse::new("a", "T", "Go").with_header("trace", "t-1");
        let next = impulse.redelivered("boom");

        assert_eq!(next.id, impulse.id);
        assert_eq!(next.delivery_count, 1);
        assert_eq!(next.last_error(), Some("boom"));
        assert_eq!(next.headers.get("trace").map(String::as_str), Some("t-1"));
        assert!(impulse.last_error().is_none());
    }

    #[test]
    fn test_reencoding_a_decoded_impulse_is_byte_identical() {
        let impulse = Impulse::new("a", "T", "Go")
            .with_payload(json!({"z": 1, "a": [1.5, "x", null], "m": {"k": true}}))
            .with_header("b", "2")
            .with_header("a", "1");

        let first = codec::encode(&impulse, SerializerType::MessagePack).unwrap();
        let decoded: Impulse = codec::decode(&first).unwrap().unwrap();
        let second = codec::encode(&decoded, SerializerType::MessagePack).unwrap();

        assert_eq!(decoded, impulse);
        assert_eq!(first, second);
    }

    #[test]
    fn test_fence_tokens_are_unique() {
        let a = new_fence_token();
        let b = new_fence_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_lease_constructors() {
        let lease = FlowLease::granted("f", "tok");
        assert!(lease.success);
        assert_eq!(lease.token, "tok");

        let busy = FlowLease::contended("f");
        assert!(!busy.success);
        assert!(busy.token.is_empty());
    }

    #[test]
    fn test_terminal_commands() {
        assert!(FlowCommand::Complete { output: None }.is_terminal());
        assert!(FlowCommand::Fail { reason: "x".into() }.is_terminal());
        assert!(!FlowCommand::Continue.is_terminal());
        assert!(
            !FlowCommand::WaitTimer {
                duration: Duration::from_secs(1)
            }
            .is_terminal()
        );
        assert_eq!(
            FlowCommand::WaitForSignal {
                name: "Pay".into(),
                timeout: None
            }
            .kind(),
            "wait_for_signal"
        );
    }

    #[test]
    fn test_command_json_shape() {
        let cmd = FlowCommand::Run {
            operation: "charge".into(),
            input: Some(json!({"amount": 10})),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["kind"], "run");
        assert_eq!(value["operation"], "charge");
    }
}
