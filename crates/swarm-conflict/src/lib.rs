// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C7 (Conflict Session Manager) and C8 (Consensus Executor): what happens
//! after the ledger (C2) flags two agents writing the same `(address,
//! tool_name)` pair. A dedicated IRC channel hosts the discussion, every
//! participant eventually marks a consensus statement, and once all of them
//! have, an LLM call turns the discussion into one concrete tool call that
//! gets enforced back onto every agent still alive (§4.7, §4.8).

mod enforce;
mod executor;
mod session;

pub use enforce::{enforce_consensus, verify_consensus_applied, EnforcementOutcome};
pub use executor::{format_consensus_prompt, ConsensusExecutor};
pub use session::SessionManager;
