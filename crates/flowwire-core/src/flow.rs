// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow contract.
//!
//! User code implements the typed [`Flow`] trait. The executor never sees the
//! concrete type: it drives every flow through the object-safe
//! [`FlowInstance`] contract, which [`FlowSlot`] implements for any `Flow`.
//!
//! A tick on an instance always runs in this order:
//!
//! ```text
//! set_context ─► hydrate ─► dispatch_signal* ─► execute ─► persist ─► take_context ─► reset
//! ```

use std::any::Any;
use std::collections::HashSet;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::context::FlowContext;
use crate::model::{FlowCommand, FlowMode};
use crate::state::{EnvelopeRef, StateEnvelope, StatePolicy, TickHeader};

/// Failure reported by flow logic.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum FlowError {
    /// The flow has no handler for this signal.
    #[error("unknown signal '{0}'")]
    UnknownSignal(String),

    /// The signal payload is missing or has the wrong shape.
    #[error("invalid payload for '{signal}': {message}")]
    InvalidPayload {
        /// Signal being dispatched.
        signal: String,
        /// What was wrong with it.
        message: String,
    },

    /// The flow refused to proceed.
    #[error("{0}")]
    Logic(String),

    /// A step ran without an execution context attached.
    #[error("no execution context attached")]
    MissingContext,

    /// Flow code panicked. Carries the panic message.
    #[error("flow panicked: {0}")]
    Panicked(String),
}

impl FlowError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownSignal(_) => "UNKNOWN_SIGNAL",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::Logic(_) => "FLOW_LOGIC",
            Self::MissingContext => "MISSING_CONTEXT",
            Self::Panicked(_) => "FLOW_PANIC",
        }
    }

    /// Turn a caught panic payload into a `Panicked` error.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::Panicked(panic_message(payload))
    }

    /// Deserialize a signal payload into `T`, mapping failure to `InvalidPayload`.
    pub fn parse_payload<T: DeserializeOwned>(
        signal: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<T, FlowError> {
        let value = payload.cloned().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|e| FlowError::InvalidPayload {
            signal: signal.to_string(),
            message: e.to_string(),
        })
    }
}

/// Text of a panic payload, as passed to `panic!`.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Static description of a flow type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowDefinition {
    /// Short name carried by impulses, e.g. `"Order"`.
    pub name: String,
    /// Fully qualified name, also accepted on impulses.
    pub full_name: Option<String>,
    pub mode: FlowMode,
    /// Impulse names allowed to create a cold circuit flow.
    pub energize_impulses: HashSet<String>,
}

impl FlowDefinition {
    /// A flow any impulse can create.
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            full_name: None,
            mode: FlowMode::Memory,
            energize_impulses: HashSet::new(),
        }
    }

    /// A flow that only starts on one of its energize impulses.
    pub fn circuit<I, S>(name: impl Into<String>, energize: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            full_name: None,
            mode: FlowMode::Circuit,
            energize_impulses: energize.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }
}

/// A user-defined state machine.
///
/// Instances are pooled and reused across flow ids, so everything a flow
/// remembers between ticks must live in `State`; fields outside it are
/// cleared by [`reset`](Flow::reset).
pub trait Flow: Send + 'static {
    /// Persisted state. `Default` is the cold state.
    type State: Serialize + DeserializeOwned + Default + Send + 'static;

    fn definition() -> FlowDefinition
    where
        Self: Sized;

    fn set_state(&mut self, state: Self::State);

    fn state(&self) -> &Self::State;

    /// Apply one signal.
    fn dispatch_signal(
        &mut self,
        ctx: &mut FlowContext,
        name: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), FlowError>;

    /// Decide what happens next. Called exactly once per tick, after all signals.
    fn execute(&mut self, ctx: &mut FlowContext) -> Result<FlowCommand, FlowError>;

    /// Drop everything tied to the previous tenant.
    fn reset(&mut self) {
        self.set_state(Self::State::default());
    }
}

/// Object-safe view of a flow instance used by the executor and the pools.
pub trait FlowInstance: Send {
    fn flow_type(&self) -> &str;

    /// Lend an execution context to the instance for one tick.
    fn set_context(&mut self, ctx: Box<FlowContext>);

    /// Take the lent context back.
    fn take_context(&mut self) -> Option<Box<FlowContext>>;

    fn context_mut(&mut self) -> Option<&mut FlowContext>;

    /// Load a persisted envelope, or the default state when `blob` is `None`.
    ///
    /// Returns the envelope header of a warm flow.
    fn hydrate(&mut self, blob: Option<&[u8]>) -> Result<Option<TickHeader>, CodecError>;

    /// Encode the current state inside an envelope.
    fn persist(&self, header: &TickHeader, policy: &StatePolicy) -> Result<Vec<u8>, CodecError>;

    fn dispatch_signal(
        &mut self,
        name: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), FlowError>;

    fn execute(&mut self) -> Result<FlowCommand, FlowError>;

    /// Serialize the current state as JSON, for inspection.
    fn state_json(&self) -> Result<serde_json::Value, CodecError>;

    /// Clear state and drop any lent context.
    fn reset(&mut self);
}

/// Adapter from a typed [`Flow`] to [`FlowInstance`].
pub struct FlowSlot<F: Flow> {
    flow_type: String,
    flow: F,
    ctx: Option<Box<FlowContext>>,
}

impl<F: Flow> FlowSlot<F> {
    pub fn new(flow_type: impl Into<String>, flow: F) -> Self {
        Self {
            flow_type: flow_type.into(),
            flow,
            ctx: None,
        }
    }

    pub fn flow(&self) -> &F {
        &self.flow
    }
}

impl<F: Flow> FlowInstance for FlowSlot<F> {
    fn flow_type(&self) -> &str {
        &self.flow_type
    }

    fn set_context(&mut self, ctx: Box<FlowContext>) {
        self.ctx = Some(ctx);
    }

    fn take_context(&mut self) -> Option<Box<FlowContext>> {
        self.ctx.take()
    }

    fn context_mut(&mut self) -> Option<&mut FlowContext> {
        self.ctx.as_deref_mut()
    }

    fn hydrate(&mut self, blob: Option<&[u8]>) -> Result<Option<TickHeader>, CodecError> {
        let envelope = match blob {
            Some(bytes) => codec::decode::<StateEnvelope<F::State>>(bytes)?,
            None => None,
        };
        match envelope {
            Some(envelope) => {
                let (header, state) = envelope.into_parts();
                self.flow.set_state(state);
                Ok(Some(header))
            }
            None => {
                self.flow.set_state(F::State::default());
                Ok(None)
            }
        }
    }

    fn persist(&self, header: &TickHeader, policy: &StatePolicy) -> Result<Vec<u8>, CodecError> {
        let envelope = EnvelopeRef::new(header, self.flow.state());
        policy.encode(&envelope)
    }

    fn dispatch_signal(
        &mut self,
        name: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), FlowError> {
        let ctx = self.ctx.as_deref_mut().ok_or(FlowError::MissingContext)?;
        self.flow.dispatch_signal(ctx, name, payload)
    }

    fn execute(&mut self) -> Result<FlowCommand, FlowError> {
        let ctx = self.ctx.as_deref_mut().ok_or(FlowError::MissingContext)?;
        self.flow.execute(ctx)
    }

    fn state_json(&self) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(self.flow.state()).map_err(|e| CodecError::Serialization {
            operation: "encode",
            format: codec::SerializerType::Json,
            type_name: std::any::type_name::<F::State>(),
            message: e.to_string(),
        })
    }

    fn reset(&mut self) {
        self.flow.reset();
        self.ctx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::RngState;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Tally {
        total: i64,
        notes: Vec<String>,
    }

    #[derive(Default)]
    struct Adder {
        state: Tally,
    }

    impl Flow for Adder {
        type State = Tally;

        fn definition() -> FlowDefinition {
            FlowDefinition::memory("Adder")
        }

        fn set_state(&mut self, state: Tally) {
            self.state = state;
        }

        fn state(&self) -> &Tally {
            &self.state
        }

        fn dispatch_signal(
            &mut self,
            ctx: &mut FlowContext,
            name: &str,
            payload: Option<&serde_json::Value>,
        ) -> Result<(), FlowError> {
            match name {
                "Add" => {
                    let n: i64 = FlowError::parse_payload(name, payload)?;
                    self.state.total += n;
                    self.state.notes.push(ctx.flow_id().to_string());
                    Ok(())
                }
                other => Err(FlowError::UnknownSignal(other.to_string())),
            }
        }

        fn execute(&mut self, _ctx: &mut FlowContext) -> Result<FlowCommand, FlowError> {
            Ok(FlowCommand::Continue)
        }
    }

    fn header() -> TickHeader {
        TickHeader {
            tick: 3,
            rng: RngState {
                s0: 1,
                s1: 2,
                s2: 3,
                s3: 4,
            },
            history: Vec::new(),
        }
    }

    #[test]
    fn test_slot_requires_context() {
        let mut slot = FlowSlot::new("Adder", Adder::default());
        let err = slot.dispatch_signal("Add", Some(&json!(1))).unwrap_err();
        assert_eq!(err, FlowError::MissingContext);
        assert_eq!(slot.execute().unwrap_err(), FlowError::MissingContext);
    }

    #[test]
    fn test_slot_round_trips_state_through_envelope() {
        let mut slot = FlowSlot::new("Adder", Adder::default());
        slot.set_context(Box::new(FlowContext::for_flow("a-1")));
        slot.dispatch_signal("Add", Some(&json!(5))).unwrap();

        let blob = slot.persist(&header(), &StatePolicy::default()).unwrap();

        let mut other = FlowSlot::new("Adder", Adder::default());
        let restored = other.hydrate(Some(&blob)).unwrap().unwrap();
        assert_eq!(restored, header());
        assert_eq!(other.flow().state.total, 5);
        assert_eq!(other.flow().state.notes, vec!["a-1".to_string()]);
    }

    #[test]
    fn test_cold_hydrate_yields_default_state() {
        let mut slot = FlowSlot::new("Adder", Adder::default());
        slot.flow.state.total = 99;
        assert!(slot.hydrate(None).unwrap().is_none());
        assert_eq!(slot.flow().state, Tally::default());
    }

    #[test]
    fn test_reset_clears_state_and_context() {
        let mut slot = FlowSlot::new("Adder", Adder::default());
        slot.set_context(Box::new(FlowContext::for_flow("a-1")));
        slot.dispatch_signal("Add", Some(&json!(2))).unwrap();

        slot.reset();
        assert_eq!(slot.flow().state, Tally::default());
        assert!(slot.take_context().is_none());
        assert_eq!(slot.state_json().unwrap(), json!({"total": 0, "notes": []}));
    }

    #[test]
    fn test_payload_errors() {
        let mut slot = FlowSlot::new("Adder", Adder::default());
        slot.set_context(Box::new(FlowContext::for_flow("a-1")));

        let err = slot.dispatch_signal("Add", Some(&json!("x"))).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PAYLOAD");

        let err = slot.dispatch_signal("Nope", None).unwrap_err();
        assert_eq!(err, FlowError::UnknownSignal("Nope".to_string()));
    }

    #[test]
    fn test_definitions() {
        let def = FlowDefinition::circuit("Order", ["Place"]).with_full_name("shop::Order");
        assert_eq!(def.mode, FlowMode::Circuit);
        assert!(def.energize_impulses.contains("Place"));
        assert_eq!(def.full_name.as_deref(), Some("shop::Order"));
        assert_eq!(Adder::definition().mode, FlowMode::Memory);
    }

    #[test]
    fn test_panic_payloads() {
        let caught = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(
            FlowError::from_panic(caught.as_ref()),
            FlowError::Panicked("static message".to_string())
        );

        let code = 7;
        let caught = std::panic::catch_unwind(|| panic!("formatted {}", code)).unwrap_err();
        let err = FlowError::from_panic(caught.as_ref());
        assert_eq!(err.to_string(), "flow panicked: formatted 7");
        assert_eq!(err.error_code(), "FLOW_PANIC");

        let caught = std::panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "non-string panic payload");
    }
}
