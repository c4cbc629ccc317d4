// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Demo flows.

mod counter;
mod order;

pub use counter::{Counter, CounterState};
pub use order::{Order, OrderState, OrderStatus};
