// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Memory-mode counter.
//!
//! | Impulse | Payload | Effect |
//! |---------|---------|--------|
//! | `Increment` | optional integer, default 1 | adds to the total |
//! | `Decrement` | optional integer, default 1 | subtracts from the total |
//! | `Stop` | none | completes with the total |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowwire_core::{Flow, FlowCommand, FlowContext, FlowDefinition, FlowError};

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
    pub total: i64,
    /// Impulses applied so far.
    pub updates: u64,
    pub stopped: bool,
}

#[derive(Debug, Default)]
pub struct Counter {
    state: CounterState,
}

fn step(signal: &str, payload: Option<&Value>) -> Result<i64, FlowError> {
    match payload {
        None | Some(Value::Null) => Ok(1),
        some => FlowError::parse_payload(signal, some),
    }
}

impl Flow for Counter {
    type State = CounterState;

    fn definition() -> FlowDefinition {
        FlowDefinition::memory("Counter").with_full_name("flowwire.demo.Counter")
    }

    fn set_state(&mut self, state: CounterState) {
        self.state = state;
    }

    fn state(&self) -> &CounterState {
        &self.state
    }

    fn dispatch_signal(
        &mut self,
        _ctx: &mut FlowContext,
        name: &str,
        payload: Option<&Value>,
    ) -> Result<(), FlowError> {
        if self.state.stopped {
            return Err(FlowError::Logic("counter already stopped".to_string()));
        }
        match name {
            "Increment" => self.state.total += step(name, payload)?,
            "Decrement" => self.state.total -= step(name, payload)?,
            "Stop" => self.state.stopped = true,
            other => return Err(FlowError::UnknownSignal(other.to_string())),
        }
        self.state.updates += 1;
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut FlowContext) -> Result<FlowCommand, FlowError> {
        if self.state.stopped {
            return Ok(FlowCommand::Complete {
                output: Some(Value::from(self.state.total)),
            });
        }
        Ok(FlowCommand::Continue)
    }
}
