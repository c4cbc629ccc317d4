// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted state envelope.
//!
//! The state key of a flow holds one codec blob of [`StateEnvelope`]: the
//! flow's own state plus the bookkeeping the executor needs to resume it
//! (committed tick count, PRNG position, recent history).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError, SerializerType};
use crate::config::FlowWireConfig;
use crate::random::RngState;

/// Number of history entries kept per flow.
pub const HISTORY_LIMIT: usize = 100;

/// One applied impulse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tick: u64,
    pub impulse_id: String,
    pub impulse_name: String,
    pub at: DateTime<Utc>,
}

/// Everything in the envelope except the flow's state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TickHeader {
    /// Committed ticks so far.
    pub tick: u64,
    /// PRNG position at the start of the next tick.
    pub rng: RngState,
    pub history: Vec<HistoryEntry>,
}

impl TickHeader {
    /// Append an entry, dropping the oldest beyond [`HISTORY_LIMIT`].
    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }
}

/// Decoded form of a state blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEnvelope<S> {
    pub tick: u64,
    pub rng: RngState,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub state: S,
}

impl<S> StateEnvelope<S> {
    pub fn into_parts(self) -> (TickHeader, S) {
        (
            TickHeader {
                tick: self.tick,
                rng: self.rng,
                history: self.history,
            },
            self.state,
        )
    }
}

/// Serialize-only twin of [`StateEnvelope`] that borrows its parts.
#[derive(Debug, Serialize)]
pub struct EnvelopeRef<'a, S> {
    tick: u64,
    rng: RngState,
    history: &'a [HistoryEntry],
    state: &'a S,
}

impl<'a, S: Serialize> EnvelopeRef<'a, S> {
    pub fn new(header: &'a TickHeader, state: &'a S) -> Self {
        Self {
            tick: header.tick,
            rng: header.rng,
            history: &header.history,
            state,
        }
    }
}

/// How state blobs are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatePolicy {
    pub format: SerializerType,
    pub compress: bool,
    pub compress_above_bytes: usize,
}

impl Default for StatePolicy {
    fn default() -> Self {
        Self {
            format: SerializerType::MessagePack,
            compress: true,
            compress_above_bytes: 1024,
        }
    }
}

impl StatePolicy {
    pub fn from_config(config: &FlowWireConfig) -> Self {
        Self {
            format: config.serialization.state_serializer,
            compress: config.storage.compress_inline_state,
            compress_above_bytes: config.storage.compress_above_bytes,
        }
    }

    /// Encode with the configured format. Plain MessagePack larger than the
    /// threshold is re-encoded compressed when compression is on.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let bytes = codec::encode(value, self.format)?;
        if self.format == SerializerType::MessagePack
            && self.compress
            && bytes.len() > self.compress_above_bytes
        {
            return codec::encode(value, SerializerType::MessagePackCompressed);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tick: u64) -> HistoryEntry {
        HistoryEntry {
            tick,
            impulse_id: format!("i-{}", tick),
            impulse_name: "Go".to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut header = TickHeader::default();
        for tick in 0..(HISTORY_LIMIT as u64 + 25) {
            header.record(entry(tick));
        }
        assert_eq!(header.history.len(), HISTORY_LIMIT);
        assert_eq!(header.history[0].tick, 25);
        assert_eq!(
            header.history.last().map(|e| e.tick),
            Some(HISTORY_LIMIT as u64 + 24)
        );
    }

    #[test]
    fn test_borrowed_envelope_decodes_as_owned() {
        let mut header = TickHeader {
            tick: 7,
            rng: RngState {
                s0: 9,
                s1: 8,
                s2: 7,
                s3: 6,
            },
            history: Vec::new(),
        };
        header.record(entry(6));
        let state = vec![1u32, 2, 3];

        let bytes = StatePolicy::default()
            .encode(&EnvelopeRef::new(&header, &state))
            .unwrap();
        let decoded: StateEnvelope<Vec<u32>> = codec::decode(&bytes).unwrap().unwrap();

        let (restored, restored_state) = decoded.into_parts();
        assert_eq!(restored, header);
        assert_eq!(restored_state, state);
    }

    #[test]
    fn test_large_state_is_compressed() {
        let policy = StatePolicy {
            compress_above_bytes: 64,
            ..StatePolicy::default()
        };
        let small = policy.encode(&"tiny").unwrap();
        assert_eq!(small[0], SerializerType::MessagePack.tag());

        let large = policy.encode(&"x".repeat(500)).unwrap();
        assert_eq!(large[0], SerializerType::MessagePackCompressed.tag());
        let back: String = codec::decode(&large).unwrap().unwrap();
        assert_eq!(back.len(), 500);
    }

    #[test]
    fn test_compression_only_applies_to_plain_messagepack() {
        let json = StatePolicy {
            format: SerializerType::Json,
            compress: true,
            compress_above_bytes: 1,
        };
        assert_eq!(
            json.encode(&"x".repeat(100)).unwrap()[0],
            SerializerType::Json.tag()
        );

        let off = StatePolicy {
            compress: false,
            compress_above_bytes: 1,
            ..StatePolicy::default()
        };
        assert_eq!(
            off.encode(&"x".repeat(100)).unwrap()[0],
            SerializerType::MessagePack.tag()
        );
    }

    #[test]
    fn test_policy_from_config() {
        let config = FlowWireConfig::default()
            .with_state_serializer(SerializerType::Json)
            .with_inline_compression(false, 10);
        let policy = StatePolicy::from_config(&config);
        assert_eq!(policy.format, SerializerType::Json);
        assert!(!policy.compress);
        assert_eq!(policy.compress_above_bytes, 10);
    }
}
