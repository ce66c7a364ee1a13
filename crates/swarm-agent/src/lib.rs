// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C11: the agent-side mirror of C7. Every agent process links this crate
//! to pre-check its own writes against the ledger, open and participate in
//! conflict channels, answer enforced manual tool calls, and replicate
//! patches / no-go zones broadcast by peers (§4.11).

mod config;

pub use config::AgentConfig;

use serde_json::Value;
use swarm_core::ports::ProgramDatabase;
use swarm_core::{ConflictSession, Ea, SwarmError, ToolConflict};
use swarm_ledger::{deserialize_zone, LedgerHandle, NoGoZoneRegistry};
use tracing::{info, warn};

/// What happened while handling one inbound bus frame, surfaced so a caller
/// driving the event loop can log/test without re-parsing the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    /// A peer's `MANUAL_TOOL_EXEC` was executed locally and acknowledged.
    ManualToolExecuted { tool_name: String, result: Value },
    /// The conflict channel received `CONSENSUS_COMPLETE`; the caller should
    /// leave the channel and resume its task.
    ConsensusComplete,
    /// A replicated patch from another agent was applied locally.
    PatchApplied { source_agent: String, tool_name: String },
    /// A broadcast no-go zone was registered locally.
    NoGoZoneRegistered { start: Ea, end: Ea },
    /// The orchestrator invited us into a conflict channel via
    /// `CONFLICT_INVITE`; the caller should join `channel` and post its
    /// own summary message (§4.11 step 2, driven by `JOIN_CONFLICT`).
    ConflictInviteReceived { channel: String },
    /// The frame wasn't one C11 cares about (plain conversation, a
    /// `MARKED_CONSENSUS` from a peer, etc).
    Ignored,
}

/// Drives the agent side of the conflict protocol for one agent process
/// (§4.11). Holds the collaborators an agent needs to both detect conflicts
/// locally (the ledger) and act on them (the bus, the no-go registry, and
/// the program database the enforced tool calls are replayed against).
pub struct ConflictClient {
    self_id: String,
    ledger: LedgerHandle,
    nogo: std::sync::Arc<NoGoZoneRegistry>,
    db: std::sync::Arc<dyn ProgramDatabase>,
}

impl ConflictClient {
    pub fn new(
        self_id: impl Into<String>,
        ledger: LedgerHandle,
        nogo: std::sync::Arc<NoGoZoneRegistry>,
        db: std::sync::Arc<dyn ProgramDatabase>,
    ) -> Self {
        Self { self_id: self_id.into(), ledger, nogo, db }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Before executing any write-class tool, ask the ledger whether a
    /// peer has already touched this `(address, tool_name)` in a
    /// conflicting way (§4.11 pre-check, §4.2).
    pub fn precheck(&self, tool_name: &str, address: Ea, parameters: &Value) -> Result<Vec<ToolConflict>, SwarmError> {
        self.ledger.check_for_conflicts(&self.self_id, address, tool_name, parameters)
    }

    /// Every agent id on the other side of `conflicts`, excluding ourselves
    /// and without duplicates.
    pub fn other_agents(&self, conflicts: &[ToolConflict]) -> Vec<String> {
        let mut agents: Vec<String> = conflicts
            .iter()
            .flat_map(|c| [c.first_call.agent_id.clone(), c.second_call.agent_id.clone()])
            .filter(|id| id != &self.self_id)
            .collect();
        agents.sort();
        agents.dedup();
        agents
    }

    /// Build the deterministic conflict channel name for `(address,
    /// tool_name)` (§4.11 step 1).
    pub fn channel_for(&self, address: Ea, tool_name: &str) -> String {
        ConflictSession::channel_name(address, tool_name)
    }

    /// Render the summary message an agent posts to the conflict channel
    /// right after joining it (§4.11 step 2).
    pub fn summary_message(&self, tool_name: &str, address: Ea, parameters: &Value) -> String {
        format!("I intend to call {tool_name} at {address:#x} with parameters {parameters}")
    }

    /// The `JOIN_CONFLICT|<other_agent>|<channel>` frame broadcast on
    /// `#agents` for one peer (§4.11 step 3).
    pub fn join_conflict_frame(&self, other_agent: &str, channel: &str) -> String {
        format!("JOIN_CONFLICT|{other_agent}|{channel}")
    }

    /// The `MARKED_CONSENSUS|<self>|<text>` frame an agent sends once it
    /// decides the discussion has converged (§4.11 step 4). Deciding *when*
    /// to send this is the caller's responsibility (driven by its own
    /// LLM-backed reasoning loop); this crate only knows the wire shape.
    pub fn marked_consensus_frame(&self, text: &str) -> String {
        format!("MARKED_CONSENSUS|{}|{text}", self.self_id)
    }

    /// Parse and, where applicable, act on one inbound `PRIVMSG` payload.
    /// `channel` is the channel the frame arrived on — callers subscribe to
    /// the conflict channel, `#agents`, and their own `#agent_<id>` and
    /// route every event through this one entrypoint (§4.11 steps 5/6,
    /// patch replication, no-go replication).
    pub async fn handle_frame(&self, channel: &str, payload: &str) -> Result<AgentAction, SwarmError> {
        if let Some(rest) = payload.strip_prefix("MANUAL_TOOL_EXEC|") {
            return self.handle_manual_tool_exec(rest).await;
        }
        if payload == "CONSENSUS_COMPLETE" {
            return Ok(AgentAction::ConsensusComplete);
        }
        if let Some(rest) = payload.strip_prefix("CONFLICT_INVITE|") {
            return Ok(self.handle_conflict_invite(rest));
        }
        if let Some(rest) = payload.strip_prefix("PATCH|") {
            return self.handle_patch(rest).await;
        }
        if let Some(rest) = payload.strip_prefix("NOGO|") {
            return self.handle_nogo(rest);
        }
        let _ = channel;
        Ok(AgentAction::Ignored)
    }

    /// `MANUAL_TOOL_EXEC|<agent_id>|<tool_name>|<params_json>`. Frames
    /// addressed to another agent are silently ignored — every subscriber
    /// to a conflict channel sees every frame on it.
    async fn handle_manual_tool_exec(&self, rest: &str) -> Result<AgentAction, SwarmError> {
        let mut parts = rest.splitn(3, '|');
        let (Some(agent_id), Some(tool_name), Some(params_str)) = (parts.next(), parts.next(), parts.next()) else {
            return Ok(AgentAction::Ignored);
        };
        if agent_id != self.self_id {
            return Ok(AgentAction::Ignored);
        }

        let mut params: Value = serde_json::from_str(params_str)
            .map_err(|e| SwarmError::Collaborator(format!("bad MANUAL_TOOL_EXEC parameters: {e}")))?;
        if let Some(obj) = params.as_object_mut() {
            obj.insert("__is_manual".into(), Value::Bool(true));
            obj.insert("__enforced_by".into(), Value::String("orchestrator".into()));
        }

        let address = params.get("address").and_then(Value::as_u64).unwrap_or(0);
        let result = self.db.execute(tool_name, address, &params).await?;
        self.ledger.record(&self.self_id, tool_name, address, params)?;

        info!(agent_id = %self.self_id, tool_name, "applied enforced manual tool call");
        Ok(AgentAction::ManualToolExecuted { tool_name: tool_name.to_string(), result })
    }

    /// `PATCH|<tool>|<source_agent>|<addr_hex>|<params_json>` received on
    /// `#agent_<self_id>`; applies a peer's write locally, prefixing the
    /// description with `[<source_agent>]:` (§C.2 of SPEC_FULL.md, mirrors
    /// `replicate_patch_to_agents`).
    async fn handle_patch(&self, rest: &str) -> Result<AgentAction, SwarmError> {
        let mut parts = rest.splitn(4, '|');
        let (Some(tool_name), Some(source_agent), Some(addr_hex), Some(params_str)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Ok(AgentAction::Ignored);
        };
        if source_agent == self.self_id {
            return Ok(AgentAction::Ignored);
        }

        let address = Ea::from_str_radix(addr_hex.trim_start_matches("0x"), 16)
            .map_err(|e| SwarmError::Collaborator(format!("bad PATCH address {addr_hex}: {e}")))?;
        let mut params: Value = serde_json::from_str(params_str)
            .map_err(|e| SwarmError::Collaborator(format!("bad PATCH parameters: {e}")))?;
        if let Some(obj) = params.as_object_mut() {
            let existing = obj.get("description").and_then(Value::as_str).unwrap_or("").to_string();
            obj.insert("description".into(), Value::String(format!("[{source_agent}]: {existing}")));
        }

        self.db.execute(tool_name, address, &params).await?;
        self.ledger.record(&self.self_id, tool_name, address, params)?;

        info!(source_agent, tool_name, "applied replicated patch");
        Ok(AgentAction::PatchApplied { source_agent: source_agent.to_string(), tool_name: tool_name.to_string() })
    }

    /// `CONFLICT_INVITE|<target>|<channel>` on `#agents`; the orchestrator's
    /// answer to our own `JOIN_CONFLICT` request (§6 wire table). Frames
    /// addressed to another agent are ignored.
    fn handle_conflict_invite(&self, rest: &str) -> AgentAction {
        let mut parts = rest.splitn(2, '|');
        let (Some(target), Some(channel)) = (parts.next(), parts.next()) else {
            return AgentAction::Ignored;
        };
        if target != self.self_id {
            return AgentAction::Ignored;
        }
        AgentAction::ConflictInviteReceived { channel: channel.to_string() }
    }

    /// `NOGO|{SEGMENT|CAVE}|<agent_id>|<start_hex>|<end_hex>` on `#agents`;
    /// registers the zone locally and mirrors it as a placeholder segment
    /// (§4.4 broadcast protocol, §4.11 no-go replication).
    fn handle_nogo(&self, rest: &str) -> Result<AgentAction, SwarmError> {
        let line = format!("NOGO|{rest}");
        let Some(zone) = deserialize_zone(&line) else {
            warn!(line, "received malformed NOGO frame");
            return Ok(AgentAction::Ignored);
        };
        let (start, end) = (zone.start, zone.end);
        self.nogo.add_zone(zone);
        Ok(AgentAction::NoGoZoneRegistered { start, end })
    }
}
