// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// The per-agent config `swarm-spawn::AgentSpawner::spawn_agent_with_id`
/// writes to `<workspace>/configs/<agent_id>_config.json` and the
/// `swarm-agent` binary reads on startup via `--config` (§4.6, §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub task: String,
    pub database_path: String,
    pub binary_path: String,
    /// `<workspace_root>/<binary_name>/tool_calls.db` — the shared C2 store
    /// every agent process opens alongside the orchestrator (§4.2, §6
    /// persisted layout).
    pub ledger_path: String,
    /// The already-allocated bus port (§4.1 port allocation happens once,
    /// orchestrator-side, and is threaded through to every spawned agent).
    pub bus_port: u16,
    /// This agent's `memories/` namespace directory under its database fork
    /// (§6 persisted layout `agents/<agent_id>/memories/...`), preserved
    /// across a zero-write discard (§4.5).
    #[serde(default)]
    pub memory_dir: String,
    /// Model settings for the agent's own LLM-driven reasoning loop,
    /// independent of the orchestrator's (§6: per-agent model override).
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "AgentConfig::default_max_tokens")]
    pub max_tokens: u32,
}

impl AgentConfig {
    fn default_max_tokens() -> u32 {
        8192
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
