// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C2 (Tool-Call Ledger) and C3 (No-Go Zone Registry): the two durable,
//! process-shared records that conflict detection is built on. Both live in
//! the same embedded SQLite file (§4.2) so a crashed agent never loses
//! either its write history or its reservations.

mod ledger;
mod monitor;
mod nogo;

pub use ledger::{Ledger, LedgerHandle};
pub use monitor::LedgerMonitor;
pub use nogo::{deserialize_zone, serialize_zone, NoGoZoneRegistry};
