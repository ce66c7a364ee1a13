// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque address into the target program. Mirrors IDA's `ea_t`: an
/// unsigned offset with a dedicated sentinel for "no address".
pub type Ea = u64;

/// Sentinel meaning "no address" / "allocation failed".
pub const BADADDR: Ea = Ea::MAX;

/// Tool names that mutate persistent program-database state. Membership in
/// this set is what `ToolCall::is_write_operation` is derived from (§3).
///
/// Kept as a `const` array (not a `HashSet` built at startup) so that
/// `is_write_tool` is usable in a `const fn`-free but allocation-free way
/// from any crate without needing to thread a registry around.
const WRITE_TOOLS: &[&str] = &[
    "set_name",
    "set_comment",
    "set_type",
    "set_function_prototype",
    "patch_byte",
    "patch_bytes",
    "patch_word",
    "patch_dword",
    "patch_qword",
    "create_segment",
    "delete_segment",
    "add_function",
    "allocate_code_workspace",
    "finalize_code_injection",
];

/// Whether `tool_name` is a member of the fixed write-tool set (§3, §4.2).
pub fn is_write_tool(tool_name: &str) -> bool {
    WRITE_TOOLS.contains(&tool_name)
}

/// A single recorded tool invocation (row in the C2 ledger).
///
/// `id` is assigned by the ledger on insert and is strictly increasing;
/// once inserted a row is never modified (§3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: i64,
    pub agent_id: String,
    pub tool_name: String,
    pub address: Ea,
    pub parameters: Value,
    pub timestamp: DateTime<Utc>,
    pub is_write_operation: bool,
}

/// Two `ToolCall`s that touch the same `(tool_name, address)` key from
/// different agents, at least one of which is a write (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolConflict {
    pub first_call: ToolCall,
    pub second_call: ToolCall,
}

/// Running totals for one agent's ledger activity (supplements §4.2;
/// see SPEC_FULL.md §C.3).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentToolStats {
    pub total_calls: u64,
    pub write_calls: u64,
    pub read_calls: u64,
    pub conflicts: u64,
}

/// Orchestrator-side bookkeeping for one spawned agent (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub task: String,
    pub database_path: String,
    pub binary_path: String,
    pub process_id: i32,
    pub completed: bool,
}

impl AgentInfo {
    pub fn new(agent_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            task: task.into(),
            database_path: String::new(),
            binary_path: String::new(),
            process_id: 0,
            completed: false,
        }
    }
}

/// Transient state for one `#conflict_<addr>_<tool>` channel (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictSession {
    pub channel: String,
    pub participating_agents: BTreeSet<String>,
    pub consensus_statements: BTreeMap<String, String>,
    pub original_conflict: ToolConflict,
    pub resolved: bool,
    pub started_at: DateTime<Utc>,
}

impl ConflictSession {
    pub fn new(channel: impl Into<String>, original_conflict: ToolConflict) -> Self {
        Self {
            channel: channel.into(),
            participating_agents: BTreeSet::new(),
            consensus_statements: BTreeMap::new(),
            original_conflict,
            resolved: false,
            started_at: Utc::now(),
        }
    }

    /// A session may resolve once every participant has a consensus
    /// statement and there are at least 2 participants (§4.7, §9 open
    /// question resolved in favor of requiring >= 2).
    pub fn is_ready_to_resolve(&self) -> bool {
        !self.resolved
            && self.participating_agents.len() >= 2
            && self
                .participating_agents
                .iter()
                .all(|a| self.consensus_statements.contains_key(a))
    }

    /// Parse `#conflict_<addr_hex>_<tool_name>` back into its components.
    pub fn parse_channel(channel: &str) -> Option<(Ea, String)> {
        let rest = channel.strip_prefix("#conflict_")?;
        let (addr_str, tool_name) = rest.split_once('_')?;
        let addr = Ea::from_str_radix(addr_str, 16).ok()?;
        if tool_name.is_empty() {
            return None;
        }
        Some((addr, tool_name.to_string()))
    }

    /// Build the canonical conflict channel name for `(address, tool_name)`
    /// (§4.11 step 1 — deterministic derivation).
    pub fn channel_name(address: Ea, tool_name: &str) -> String {
        format!("#conflict_{:x}_{}", address, tool_name)
    }
}

/// The kind of no-go zone (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoGoZoneType {
    TempSegment,
    CodeCave,
}

/// A reserved address range another agent must avoid when allocating (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoGoZone {
    pub start: Ea,
    pub end: Ea,
    pub agent_id: String,
    pub zone_type: NoGoZoneType,
    pub timestamp: DateTime<Utc>,
}

impl NoGoZone {
    pub fn new(start: Ea, end: Ea, agent_id: impl Into<String>, zone_type: NoGoZoneType) -> Self {
        Self {
            start,
            end,
            agent_id: agent_id.into(),
            zone_type,
            timestamp: Utc::now(),
        }
    }

    pub fn overlaps_range(&self, start: Ea, end: Ea) -> bool {
        !(end <= self.start || start >= self.end)
    }

    pub fn contains(&self, addr: Ea) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// A temporary or permanent code segment tracked by the injection allocator
/// (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub start: Ea,
    pub end: Ea,
    pub size: u64,
    pub segment_name: String,
    pub is_temporary: bool,
}

/// What the agent-side conflict client (§4.11) knows about a peer it has
/// discovered via the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPeerInfo {
    pub agent_id: String,
    pub task: String,
    pub discovered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_tool_membership() {
        assert!(is_write_tool("set_name"));
        assert!(is_write_tool("finalize_code_injection"));
        assert!(!is_write_tool("get_bytes"));
        assert!(!is_write_tool("decompile"));
    }

    #[test]
    fn conflict_channel_round_trips() {
        let name = ConflictSession::channel_name(0x401000, "set_name");
        assert_eq!(name, "#conflict_401000_set_name");
        let (addr, tool) = ConflictSession::parse_channel(&name).unwrap();
        assert_eq!(addr, 0x401000);
        assert_eq!(tool, "set_name");
    }

    #[test]
    fn parse_channel_rejects_non_conflict() {
        assert!(ConflictSession::parse_channel("#agents").is_none());
        assert!(ConflictSession::parse_channel("#conflict_zzz_set_name").is_none());
    }

    #[test]
    fn session_requires_two_participants() {
        let call = ToolCall {
            id: 1,
            agent_id: "agent_1".into(),
            tool_name: "set_name".into(),
            address: 0x1000,
            parameters: serde_json::json!({}),
            timestamp: Utc::now(),
            is_write_operation: true,
        };
        let mut session = ConflictSession::new(
            "#conflict_1000_set_name",
            ToolConflict {
                first_call: call.clone(),
                second_call: call,
            },
        );
        session.participating_agents.insert("agent_1".into());
        session
            .consensus_statements
            .insert("agent_1".into(), "use parse_header".into());
        assert!(!session.is_ready_to_resolve(), "single participant must not resolve");

        session.participating_agents.insert("agent_2".into());
        assert!(!session.is_ready_to_resolve(), "agent_2 has not marked consensus yet");

        session
            .consensus_statements
            .insert("agent_2".into(), "agreed".into());
        assert!(session.is_ready_to_resolve());
    }

    #[test]
    fn zone_overlap_and_contains() {
        let zone = NoGoZone::new(0xA000, 0xB000, "agent_1", NoGoZoneType::TempSegment);
        assert!(zone.overlaps_range(0xA500, 0xA600));
        assert!(zone.overlaps_range(0x9000, 0xA001));
        assert!(!zone.overlaps_range(0xB000, 0xC000));
        assert!(zone.contains(0xA000));
        assert!(!zone.contains(0xB000));
    }
}
