// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Circuit-mode order flow.
//!
//! Only `Place` can create an order. Afterwards the order moves
//! `placed → paid → shipped`, or to `cancelled` from any open status.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use flowwire_core::{Flow, FlowCommand, FlowContext, FlowDefinition, FlowError};

/// How long a placed order waits for payment.
pub const PAYMENT_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    New,
    Placed,
    Paid,
    Shipped,
    Cancelled,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub status: OrderStatus,
    pub sku: String,
    pub quantity: u32,
    pub paid_cents: u64,
    pub tracking_number: Option<String>,
    pub cancel_reason: Option<String>,
}

#[derive(Deserialize)]
struct Place {
    sku: String,
    quantity: u32,
}

#[derive(Deserialize)]
struct Pay {
    amount_cents: u64,
}

#[derive(Debug, Default)]
pub struct Order {
    state: OrderState,
}

impl Order {
    fn expect_status(&self, signal: &str, allowed: &[OrderStatus]) -> Result<(), FlowError> {
        if allowed.contains(&self.state.status) {
            Ok(())
        } else {
            Err(FlowError::Logic(format!(
                "'{}' not allowed while order is {:?}",
                signal, self.state.status
            )))
        }
    }
}

impl Flow for Order {
    type State = OrderState;

    fn definition() -> FlowDefinition {
        FlowDefinition::circuit("Order", ["Place"]).with_full_name("flowwire.demo.Order")
    }

    fn set_state(&mut self, state: OrderState) {
        self.state = state;
    }

    fn state(&self) -> &OrderState {
        &self.state
    }

    fn dispatch_signal(
        &mut self,
        ctx: &mut FlowContext,
        name: &str,
        payload: Option<&Value>,
    ) -> Result<(), FlowError> {
        match name {
            "Place" => {
                self.expect_status(name, &[OrderStatus::New])?;
                let place: Place = FlowError::parse_payload(name, payload)?;
                if place.quantity == 0 {
                    return Err(FlowError::InvalidPayload {
                        signal: name.to_string(),
                        message: "quantity must be positive".to_string(),
                    });
                }
                self.state.sku = place.sku;
                self.state.quantity = place.quantity;
                self.state.status = OrderStatus::Placed;
            }
            "Pay" => {
                self.expect_status(name, &[OrderStatus::Placed])?;
                let pay: Pay = FlowError::parse_payload(name, payload)?;
                self.state.paid_cents = pay.amount_cents;
                self.state.status = OrderStatus::Paid;
            }
            "Ship" => {
                self.expect_status(name, &[OrderStatus::Paid])?;
                // Replays of this tick draw the same number.
                let tracking = ctx.rng().next_below(1_000_000_000);
                self.state.tracking_number = Some(format!("FW{:09}", tracking));
                self.state.status = OrderStatus::Shipped;
            }
            "Cancel" => {
                self.expect_status(name, &[OrderStatus::Placed, OrderStatus::Paid])?;
                let reason = payload
                    .and_then(Value::as_str)
                    .unwrap_or("cancelled by customer");
                self.state.cancel_reason = Some(reason.to_string());
                self.state.status = OrderStatus::Cancelled;
            }
            other => return Err(FlowError::UnknownSignal(other.to_string())),
        }
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut FlowContext) -> Result<FlowCommand, FlowError> {
        let state = &self.state;
        Ok(match state.status {
            OrderStatus::New => FlowCommand::Continue,
            OrderStatus::Placed => FlowCommand::WaitForSignal {
                name: "Pay".to_string(),
                timeout: Some(PAYMENT_WINDOW),
            },
            OrderStatus::Paid => FlowCommand::Run {
                operation: "reserve_stock".to_string(),
                input: Some(json!({ "sku": state.sku, "quantity": state.quantity })),
            },
            OrderStatus::Shipped => FlowCommand::Complete {
                output: Some(json!({ "tracking_number": state.tracking_number })),
            },
            OrderStatus::Cancelled => FlowCommand::Fail {
                reason: state
                    .cancel_reason
                    .clone()
                    .unwrap_or_else(|| "cancelled".to_string()),
            },
        })
    }
}
