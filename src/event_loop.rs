// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The orchestrator's side of C1/C3/C7: one long-lived task owns the bus
//! connection, relays `JOIN_CONFLICT` into `CONFLICT_INVITE`, forwards
//! `NOGO` broadcasts fired by the injection allocator, hands completed
//! agent reports to whoever is waiting for them, and kicks off consensus
//! enforcement once a conflict session becomes ready (§4.3, §4.7, §6).
use std::collections::HashMap;
use std::sync::Arc;

use swarm_bus::{BusClient, BusEvent};
use swarm_conflict::{enforce_consensus, verify_consensus_applied, ConsensusExecutor, SessionManager};
use swarm_core::{ConflictSession, SwarmError, ToolConflict};
use swarm_ledger::{LedgerHandle, NoGoZoneRegistry};
use swarm_spawn::AgentSpawner;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

/// Final reports delivered on `#results`, keyed by agent id so the control
/// loop can `await` the one it's waiting for without missing reports that
/// arrive before it starts waiting.
pub type PendingResults = Mutex<HashMap<String, oneshot::Sender<String>>>;

pub struct OrchestratorBus {
    bus: BusClient,
    bus_port: u16,
    session_mgr: Arc<SessionManager>,
    nogo: Arc<NoGoZoneRegistry>,
    ledger: LedgerHandle,
    consensus: Arc<ConsensusExecutor>,
    pending_results: Arc<PendingResults>,
    spawner: Arc<AgentSpawner>,
}

impl OrchestratorBus {
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        bus_port: u16,
        session_mgr: Arc<SessionManager>,
        nogo: Arc<NoGoZoneRegistry>,
        ledger: LedgerHandle,
        consensus: Arc<ConsensusExecutor>,
        spawner: Arc<AgentSpawner>,
    ) -> Result<(Self, Arc<PendingResults>), SwarmError> {
        let bus = BusClient::connect(bus_port, "orchestrator")
            .await
            .map_err(|e| SwarmError::BusUnavailable(e.to_string()))?;
        let pending_results = Arc::new(Mutex::new(HashMap::new()));
        let this = Self { bus, bus_port, session_mgr, nogo, ledger, consensus, pending_results: pending_results.clone(), spawner };
        Ok((this, pending_results))
    }

    /// Subscribe to the fixed set of orchestrator-owned channels (§3 "C9
    /// exclusively owns ... all channel subscriptions on the Orchestrator
    /// side").
    pub async fn subscribe(&mut self) -> Result<(), SwarmError> {
        for channel in ["#agents", "#results"] {
            self.bus.join_channel(channel).await.map_err(|e| SwarmError::BusUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Drain the bus until the connection closes. Runs for the life of the
    /// orchestrator process.
    pub async fn run(mut self) {
        while let Some(event) = self.bus.recv().await {
            let BusEvent::Privmsg { channel, sender, payload } = event else { continue };
            if let Err(e) = self.dispatch(&channel, sender.as_deref(), &payload).await {
                warn!(%channel, error = %e, "orchestrator bus dispatch failed");
            }
        }
        info!("orchestrator bus connection closed");
    }

    async fn dispatch(&mut self, channel: &str, sender: Option<&str>, payload: &str) -> Result<(), SwarmError> {
        if channel == "#agents" {
            return self.dispatch_agents_channel(sender, payload).await;
        }
        if channel == "#results" {
            return self.dispatch_results_channel(payload).await;
        }
        if channel.starts_with("#conflict_") {
            return self.dispatch_conflict_channel(channel, payload).await;
        }
        Ok(())
    }

    async fn dispatch_agents_channel(&mut self, sender: Option<&str>, payload: &str) -> Result<(), SwarmError> {
        if let Some(rest) = payload.strip_prefix("JOIN_CONFLICT|") {
            let mut parts = rest.splitn(2, '|');
            if let (Some(target), Some(channel)) = (parts.next(), parts.next()) {
                self.seed_session_from_ledger(channel)?;
                if let Some(joiner) = sender {
                    self.session_mgr.add_participant(channel, joiner);
                }
                let invite = format!("CONFLICT_INVITE|{target}|{channel}");
                self.bus.send_message("#agents", &invite).await.map_err(|e| SwarmError::BusUnavailable(e.to_string()))?;
            }
            return Ok(());
        }
        if let Some(rest) = payload.strip_prefix("NOGO|") {
            if let Some(zone) = swarm_ledger::deserialize_zone(&format!("NOGO|{rest}")) {
                self.nogo.add_zone(zone);
            }
            return Ok(());
        }
        if let Some(rest) = payload.strip_prefix("AGENT_TOKEN_UPDATE|").or_else(|| payload.strip_prefix("AGENT_TOKEN_UPDATE | ")) {
            // §C.1: republished as a tracing event; a GUI collaborator
            // (out of scope) would subscribe to this the same way it would
            // subscribe to TOOL_CALL/AGENT_RESULT.
            info!(usage = rest, "agent token usage update");
        }
        Ok(())
    }

    async fn dispatch_results_channel(&mut self, payload: &str) -> Result<(), SwarmError> {
        let Some(json_str) = payload.strip_prefix("AGENT_RESULT|") else { return Ok(()) };
        let parsed: serde_json::Value = serde_json::from_str(json_str).unwrap_or(serde_json::Value::Null);
        let Some(agent_id) = parsed.get("agent_id").and_then(serde_json::Value::as_str) else {
            warn!(json_str, "AGENT_RESULT missing agent_id");
            return Ok(());
        };
        let report = parsed.get("report").and_then(serde_json::Value::as_str).unwrap_or(json_str).to_string();

        let mut pending = self.pending_results.lock().await;
        if let Some(tx) = pending.remove(agent_id) {
            let _ = tx.send(report);
        }
        Ok(())
    }

    /// The channel name alone encodes `(address, tool_name)`; reconstruct
    /// the `ToolConflict` that opened it from the ledger's own history so
    /// `SessionManager` has something to seed with the first time either a
    /// `JOIN_CONFLICT` or a `MARKED_CONSENSUS` mentions this channel (§4.7
    /// step 1 — the channel itself is the only thing the wire protocol
    /// carries, per §6).
    fn seed_session_from_ledger(&self, channel: &str) -> Result<(), SwarmError> {
        if self.session_mgr.get(channel).is_some() {
            return Ok(());
        }
        let Some((address, tool_name)) = ConflictSession::parse_channel(channel) else {
            return Ok(());
        };
        let mut calls = self.ledger.get_address_tool_calls(address)?;
        calls.retain(|c| c.tool_name == tool_name);
        calls.sort_by_key(|c| c.id);
        if calls.len() < 2 {
            return Ok(());
        }
        let conflict = ToolConflict { first_call: calls[0].clone(), second_call: calls[1].clone() };
        self.session_mgr.get_or_start(channel, conflict);
        Ok(())
    }

    async fn dispatch_conflict_channel(&mut self, channel: &str, payload: &str) -> Result<(), SwarmError> {
        let Some(rest) = payload.strip_prefix("MARKED_CONSENSUS|") else { return Ok(()) };
        let mut parts = rest.splitn(2, '|');
        let (Some(agent_id), Some(text)) = (parts.next(), parts.next()) else { return Ok(()) };

        self.seed_session_from_ledger(channel)?;
        let Some(session) = self.session_mgr.mark_consensus(channel, agent_id, text) else {
            warn!(channel, "MARKED_CONSENSUS for unknown session");
            return Ok(());
        };
        if !session.is_ready_to_resolve() {
            return Ok(());
        }

        info!(channel, "conflict session reached consensus, enforcing on a detached worker");
        let channel = channel.to_string();
        let bus_port = self.bus_port;
        let consensus = self.consensus.clone();
        let ledger = self.ledger.clone();
        let session_mgr = self.session_mgr.clone();
        let spawner = self.spawner.clone();
        tokio::spawn(async move {
            enforce_and_verify(bus_port, channel, session, consensus, ledger, session_mgr, spawner).await;
        });
        Ok(())
    }
}

/// §4.7 steps 4–7, run on a detached worker over its own short-lived bus
/// connection so enforcement I/O never blocks the main dispatch loop.
async fn enforce_and_verify(
    bus_port: u16,
    channel: String,
    session: ConflictSession,
    consensus: Arc<ConsensusExecutor>,
    ledger: LedgerHandle,
    session_mgr: Arc<SessionManager>,
    spawner: Arc<AgentSpawner>,
) {
    let nick = format!("enforcer_{}", uuid::Uuid::new_v4());
    let mut bus = match BusClient::connect(bus_port, &nick).await {
        Ok(bus) => bus,
        Err(e) => {
            warn!(%channel, error = %e, "enforcement worker failed to connect to bus");
            return;
        }
    };
    bus.join_channel(&channel).await.ok();

    // §4.7 step 2: drop any participant whose process already exited before
    // we got here, rather than enforcing against (and timing out on) a dead
    // agent.
    let mut alive_agents = Vec::with_capacity(session.participating_agents.len());
    for agent_id in &session.participating_agents {
        if spawner.is_agent_running(agent_id).await {
            alive_agents.push(agent_id.clone());
        } else {
            warn!(%channel, agent_id, "dropping dead participant before enforcement");
        }
    }
    if alive_agents.is_empty() {
        let _ = bus.send_message(&channel, "CONSENSUS_COMPLETE").await;
        session_mgr.close(&channel);
        return;
    }

    let tool_call = match consensus.execute_consensus(&session).await {
        Ok(call) => call,
        Err(e) => {
            warn!(%channel, error = %e, "consensus executor failed");
            return;
        }
    };

    let outcome = enforce_consensus(&mut bus, &channel, &tool_call, &alive_agents).await;
    if !outcome.timed_out.is_empty() {
        warn!(%channel, timed_out = ?outcome.timed_out, "some agents did not acknowledge consensus enforcement");
    }

    let address = session.original_conflict.first_call.address;
    match verify_consensus_applied(&ledger, &alive_agents, address) {
        Ok(true) => info!(%channel, "consensus verification passed"),
        Ok(false) => warn!(%channel, "consensus verification found diverging parameters"),
        Err(e) => warn!(%channel, error = %e, "consensus verification query failed"),
    }

    session_mgr.mark_resolved(&channel);
    let _ = bus.send_message(&channel, "CONSENSUS_COMPLETE").await;
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    session_mgr.close(&channel);
}
