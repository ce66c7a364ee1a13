// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The worker process `swarm-spawn::AgentSpawner` launches for every
//! `spawn_agent` call (§4.6, §4.11). Connects to the chat-relay bus under
//! its own agent id, then runs the C11 conflict-client event loop for the
//! lifetime of the process: replying to enforced manual tool calls,
//! replicating peer patches, and mirroring no-go zone broadcasts.
//!
//! The agent's own reverse-engineering reasoning loop — the LLM-driven task
//! that decides *what* to call on the program database — is the
//! `LlmDriver`/`ProgramDatabase` collaborator pair named out of scope in §1;
//! this binary only wires the conflict-protocol seam those collaborators
//! plug into.
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use swarm_agent::{AgentAction, AgentConfig, ConflictClient};
use swarm_core::ports::{CodeCave, DisassemblyRange, ProgramDatabase, SegmentPerms};
use swarm_core::{Ea, SwarmError};
use swarm_ledger::{Ledger, NoGoZoneRegistry};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "swarm-agent", about = "Worker process for the swarm orchestrator")]
struct Args {
    /// Path to the config.json written by `AgentSpawner::spawn_agent`.
    #[arg(long)]
    config: PathBuf,
}

/// Placeholder for the out-of-scope decompiler/disassembler binding (§1,
/// §9 "program-database port"). A real deployment swaps this for the
/// concrete adapter that talks to the actual program-database process;
/// until then every call fails loudly rather than silently no-op'ing so a
/// missing binding can't masquerade as a successful tool call.
struct UnboundProgramDatabase;

#[async_trait]
impl ProgramDatabase for UnboundProgramDatabase {
    async fn execute(&self, tool_name: &str, _address: Ea, _params: &Value) -> Result<Value, SwarmError> {
        Err(SwarmError::Collaborator(format!("no program-database binding configured for tool `{tool_name}`")))
    }
    async fn find_safe_address_after_segments(&self) -> Result<Ea, SwarmError> {
        Err(SwarmError::Collaborator("no program-database binding configured".into()))
    }
    async fn create_temp_segment(&self, _addr: Ea, _size: u64, _name: &str, _perms: SegmentPerms) -> Result<(), SwarmError> {
        Err(SwarmError::Collaborator("no program-database binding configured".into()))
    }
    async fn delete_temp_segment(&self, _addr: Ea) -> Result<(), SwarmError> {
        Err(SwarmError::Collaborator("no program-database binding configured".into()))
    }
    async fn analyze_range(&self, _start: Ea, _end: Ea) -> Result<DisassemblyRange, SwarmError> {
        Err(SwarmError::Collaborator("no program-database binding configured".into()))
    }
    async fn find_code_cave(&self, _needed: u64) -> Result<Option<CodeCave>, SwarmError> {
        Err(SwarmError::Collaborator("no program-database binding configured".into()))
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(false)).try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    let config = AgentConfig::load(&args.config)?;

    info!(agent_id = %config.agent_id, task = %config.task, "agent starting");

    let ledger = Ledger::open(std::path::Path::new(&config.ledger_path))?;
    let nogo = Arc::new(NoGoZoneRegistry::new());
    let db: Arc<dyn ProgramDatabase> = Arc::new(UnboundProgramDatabase);
    let client = ConflictClient::new(config.agent_id.clone(), ledger, nogo, db);

    let mut bus = swarm_bus::BusClient::connect(config.bus_port, &config.agent_id).await?;
    bus.join_channel("#agents").await.ok();
    bus.join_channel(&format!("#agent_{}", config.agent_id)).await.ok();

    info!(agent_id = %config.agent_id, "joined #agents and its own patch-replication channel");

    while let Some(event) = bus.recv().await {
        let swarm_bus::BusEvent::Privmsg { channel, payload, .. } = event else { continue };
        match client.handle_frame(&channel, &payload).await {
            Ok(AgentAction::ConsensusComplete) => {
                bus.leave_channel(&channel).await.ok();
                info!(%channel, "consensus complete, left conflict channel");
            }
            Ok(AgentAction::ManualToolExecuted { tool_name, result }) => {
                bus.send_message(&channel, &format!("MANUAL_TOOL_RESULT|{}|success|{}", config.agent_id, result)).await.ok();
                info!(%channel, tool_name, "acknowledged manual tool execution");
            }
            Ok(AgentAction::ConflictInviteReceived { channel }) => {
                bus.join_channel(&channel).await.ok();
                let summary = format!("agent {} joining to discuss a conflicting write", config.agent_id);
                bus.send_message(&channel, &summary).await.ok();
                info!(%channel, "joined conflict channel on invite");
            }
            Ok(AgentAction::PatchApplied { .. } | AgentAction::NoGoZoneRegistered { .. } | AgentAction::Ignored) => {}
            Err(e) => {
                warn!(%channel, error = %e, "failed to handle inbound bus frame");
            }
        }
    }

    error!(agent_id = %config.agent_id, "bus connection closed, exiting");
    Ok(())
}
