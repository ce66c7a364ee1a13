// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared data model, error taxonomy, and collaborator "ports" for the swarm
//! orchestration runtime.
//!
//! This crate has no process model of its own: it is imported by every other
//! `swarm-*` crate and by both binaries (`swarm-orchestrator`, `swarm-agent`).
//! Keeping it free of `tokio`/socket/file dependencies means the data model
//! can be unit-tested without spinning up any of the real subsystems.

mod error;
mod model;
pub mod ports;

pub use error::SwarmError;
pub use model::{
    is_write_tool, AgentInfo, AgentPeerInfo, AgentToolStats, ConflictSession, Ea, NoGoZone,
    NoGoZoneType, ToolCall, ToolConflict, Workspace, BADADDR,
};
