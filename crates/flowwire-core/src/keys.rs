// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store key layout.
//!
//! Every key the engine touches is built here so that two processes with the
//! same prefix always compute byte-identical keys for the same logical entity.
//!
//! | Entity | Key |
//! |--------|-----|
//! | Lock | `P:l:<flowId>` |
//! | State | `P:s:<flowId>` |
//! | Inbox | `P:f:<flowId>:inbox` |
//! | Pending queue | `P:q:<group>:pending` |
//! | Inflight set | `P:q:<group>:inflight` |
//! | Dead-letter queue | `P:q:<group>:dlq` |

/// Separator between key segments.
pub const KEY_SEPARATOR: char = ':';

/// Join `prefix` and `segments` with `separator`.
///
/// The output is allocated once with its exact length. Empty segments are
/// accepted and kept as empty strings, so `["l", ""]` yields `"P:l:"`.
pub fn build_key(separator: char, prefix: &str, segments: &[&str]) -> String {
    let len = prefix.len()
        + segments.iter().map(|s| s.len()).sum::<usize>()
        + segments.len() * separator.len_utf8();

    let mut key = String::with_capacity(len);
    key.push_str(prefix);
    for segment in segments {
        key.push(separator);
        key.push_str(segment);
    }
    key
}

/// The three keys a tick needs for one flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowKeys {
    /// Lease key holding the fence token.
    pub lock: String,
    /// Persisted state blob.
    pub state: String,
    /// Buffered impulses awaiting the next tick.
    pub inbox: String,
}

/// The three keys backing one queue group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// FIFO list of impulses awaiting a worker.
    pub pending: String,
    /// Sorted set of popped impulses scored by visibility deadline.
    pub inflight: String,
    /// FIFO list of impulses that exhausted their retries.
    pub dlq: String,
}

/// Builds namespaced keys from a configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStrategy {
    prefix: String,
    separator: char,
}

impl KeyStrategy {
    /// Create a strategy using the default `:` separator.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            separator: KEY_SEPARATOR,
        }
    }

    /// Use a different separator.
    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn lock_key(&self, flow_id: &str) -> String {
        build_key(self.separator, &self.prefix, &["l", flow_id])
    }

    pub fn state_key(&self, flow_id: &str) -> String {
        build_key(self.separator, &self.prefix, &["s", flow_id])
    }

    pub fn inbox_key(&self, flow_id: &str) -> String {
        build_key(self.separator, &self.prefix, &["f", flow_id, "inbox"])
    }

    pub fn queue_pending_key(&self, group: &str) -> String {
        build_key(self.separator, &self.prefix, &["q", group, "pending"])
    }

    pub fn queue_inflight_key(&self, group: &str) -> String {
        build_key(self.separator, &self.prefix, &["q", group, "inflight"])
    }

    pub fn queue_dlq_key(&self, group: &str) -> String {
        build_key(self.separator, &self.prefix, &["q", group, "dlq"])
    }

    /// Resolve lock, state and inbox keys for a flow.
    pub fn flow_keys(&self, flow_id: &str) -> FlowKeys {
        FlowKeys {
            lock: self.lock_key(flow_id),
            state: self.state_key(flow_id),
            inbox: self.inbox_key(flow_id),
        }
    }

    /// Resolve pending, inflight and dead-letter keys for a queue group.
    pub fn queue_keys(&self, group: &str) -> QueueKeys {
        QueueKeys {
            pending: self.queue_pending_key(group),
            inflight: self.queue_inflight_key(group),
            dlq: self.queue_dlq_key(group),
        }
    }
}

impl Default for KeyStrategy {
    fn default() -> Self {
        Self::new("fw")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_key_layout() {
        let keys = KeyStrategy::new("fw").flow_keys("order-42");

        assert_eq!(keys.lock, "fw:l:order-42");
        assert_eq!(keys.state, "fw:s:order-42");
        assert_eq!(keys.inbox, "fw:f:order-42:inbox");
    }

    #[test]
    fn test_queue_key_layout() {
        let keys = KeyStrategy::new("app").queue_keys("default");

        assert_eq!(keys.pending, "app:q:default:pending");
        assert_eq!(keys.inflight, "app:q:default:inflight");
        assert_eq!(keys.dlq, "app:q:default:dlq");
    }

    #[test]
    fn test_keys_are_stable_across_instances() {
        let a = KeyStrategy::new("fw");
        let b = KeyStrategy::new(String::from("fw"));
        assert_eq!(a.flow_keys("x"), b.flow_keys("x"));
        assert_eq!(a.queue_keys("g"), b.queue_keys("g"));
    }

    #[test]
    fn test_empty_segments_are_kept() {
        assert_eq!(build_key(':', "fw", &["l", ""]), "fw:l:");
        assert_eq!(build_key(':', "", &["a"]), ":a");
        assert_eq!(build_key(':', "fw", &[]), "fw");
    }

    #[test]
    fn test_custom_separator_and_capacity() {
        let key = build_key('/', "root", &["q", "g", "dlq"]);
        assert_eq!(key, "root/q/g/dlq");
        assert_eq!(key.capacity(), key.len());

        let strategy = KeyStrategy::new("fw").with_separator('|');
        assert_eq!(strategy.lock_key("a"), "fw|l|a");
    }
}
