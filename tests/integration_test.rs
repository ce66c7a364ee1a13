// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end tests across crate boundaries: a single-agent merge (§8 S1),
//! a two-agent naming conflict driven through the full consensus pipeline
//! (§8 S2), and the orphan-completion path (§8 S4).
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use swarm_bus::{BusClient, BusServer};
use swarm_conflict::{enforce_consensus, verify_consensus_applied, ConsensusExecutor, SessionManager};
use swarm_core::ports::{CodeCave, DisassemblyRange, LlmDriver, LlmRequest, LlmResponse, LlmToolCall, ProgramDatabase, SegmentPerms};
use swarm_core::{ConflictSession, Ea, SwarmError, ToolConflict};
use swarm_ledger::Ledger;
use swarm_merge::{DatabaseForker, Merger};

struct RecordingDb {
    applied: std::sync::Mutex<Vec<(String, Ea, serde_json::Value)>>,
}

impl RecordingDb {
    fn new() -> Self {
        Self { applied: std::sync::Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl ProgramDatabase for RecordingDb {
    async fn execute(&self, tool_name: &str, address: Ea, params: &serde_json::Value) -> Result<serde_json::Value, SwarmError> {
        self.applied.lock().unwrap().push((tool_name.to_string(), address, params.clone()));
        Ok(json!({"ok": true}))
    }
    async fn find_safe_address_after_segments(&self) -> Result<Ea, SwarmError> {
        Ok(0)
    }
    async fn create_temp_segment(&self, _addr: Ea, _size: u64, _name: &str, _perms: SegmentPerms) -> Result<(), SwarmError> {
        Ok(())
    }
    async fn delete_temp_segment(&self, _addr: Ea) -> Result<(), SwarmError> {
        Ok(())
    }
    async fn analyze_range(&self, _start: Ea, _end: Ea) -> Result<DisassemblyRange, SwarmError> {
        Ok(DisassemblyRange { disassembly: String::new(), bytes: Vec::new() })
    }
    async fn find_code_cave(&self, _needed: u64) -> Result<Option<CodeCave>, SwarmError> {
        Ok(None)
    }
}

struct FixedDriver(LlmResponse);

#[async_trait]
impl LlmDriver for FixedDriver {
    async fn send(&self, _request: LlmRequest) -> Result<LlmResponse, SwarmError> {
        Ok(match &self.0 {
            LlmResponse::ToolCall(c) => LlmResponse::ToolCall(c.clone()),
            LlmResponse::Text(t) => LlmResponse::Text(t.clone()),
        })
    }
}

/// §8 S1 — a single agent's one write is replayed into the canonical
/// database on merge and the fork directory can be torn down afterward.
#[tokio::test]
async fn single_agent_task_merges_its_one_write() {
    let tmp = tempfile::tempdir().unwrap();
    let source_db = tmp.path().join("prog.db");
    let source_bin = tmp.path().join("prog.bin");
    tokio::fs::write(&source_db, b"db").await.unwrap();
    tokio::fs::write(&source_bin, b"bin").await.unwrap();

    let ledger = Ledger::open_in_memory().unwrap();
    let forker = DatabaseForker::new(tmp.path().join("forks"));
    let fork = forker.fork_for_agent("agent_1", &source_db, &source_bin).await.unwrap();
    assert!(fork.database_path.exists());

    ledger.record("agent_1", "set_name", 0x401000, json!({"name": "parse_header"})).unwrap();

    let db = Arc::new(RecordingDb::new());
    let merger = Merger::new(ledger, db.clone());
    let result = merger.merge_agent_changes("agent_1").await.unwrap();

    assert!(result.success);
    assert_eq!(result.changes_applied, 1);
    assert_eq!(db.applied.lock().unwrap()[0].2["name"], "parse_header");
}

/// §8 S2 — two agents write conflicting names at the same address; the
/// ledger flags the conflict, a `SessionManager` tracks both participants'
/// consensus statements, `ConsensusExecutor` extracts one tool call, and
/// `enforce_consensus` drives it through the bus to both live agents before
/// `verify_consensus_applied` confirms convergence.
#[tokio::test]
async fn two_agent_naming_conflict_reaches_verified_consensus() {
    let ledger = Ledger::open_in_memory().unwrap();
    ledger.record("agent_1", "set_name", 0x401000, json!({"name": "parse_header"})).unwrap();

    let conflicts = ledger.check_for_conflicts("agent_2", 0x401000, "set_name", &json!({"name": "read_hdr"})).unwrap();
    assert_eq!(conflicts.len(), 1);

    let channel = ConflictSession::channel_name(0x401000, "set_name");
    assert_eq!(channel, "#conflict_401000_set_name");

    let session_mgr = SessionManager::new();
    session_mgr.get_or_start(&channel, conflicts[0].clone());
    session_mgr.add_participant(&channel, "agent_1");
    session_mgr.add_participant(&channel, "agent_2");
    session_mgr.mark_consensus(&channel, "agent_1", "use parse_header");
    let session = session_mgr.mark_consensus(&channel, "agent_2", "agreed: parse_header").unwrap();
    assert!(session.is_ready_to_resolve());

    let response = LlmResponse::ToolCall(LlmToolCall {
        tool_name: "apply_consensus".into(),
        parameters: json!({"tool_name": "set_name", "parameters": {"address": 0x401000, "name": "parse_header"}}),
    });
    let executor = ConsensusExecutor::new(Arc::new(FixedDriver(response)));
    let tool_call = executor.execute_consensus(&session).await.unwrap();
    assert_eq!(tool_call.tool_name, "set_name");
    assert_eq!(tool_call.parameters["name"], "parse_header");

    let server = BusServer::bind(0).await.unwrap();
    let port = server.port();
    tokio::spawn(server.run());

    let mut enforcer = BusClient::connect(port, "enforcer").await.unwrap();
    enforcer.join_channel(&channel).await.unwrap();

    let mut agent_1 = BusClient::connect(port, "agent_1").await.unwrap();
    agent_1.join_channel(&channel).await.unwrap();
    let mut agent_2 = BusClient::connect(port, "agent_2").await.unwrap();
    agent_2.join_channel(&channel).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let ack_params = tool_call.parameters.clone();
    let ack_channel = channel.clone();
    tokio::spawn(async move {
        while let Some(swarm_bus::BusEvent::Privmsg { channel: c, payload, .. }) = agent_1.recv().await {
            if c == ack_channel && payload.starts_with("MANUAL_TOOL_EXEC|") {
                let _ = agent_1.send_message(&ack_channel, &format!("MANUAL_TOOL_RESULT|agent_1|success|{}", ack_params)).await;
                break;
            }
        }
    });
    let ack_params = tool_call.parameters.clone();
    let ack_channel = channel.clone();
    tokio::spawn(async move {
        while let Some(swarm_bus::BusEvent::Privmsg { channel: c, payload, .. }) = agent_2.recv().await {
            if c == ack_channel && payload.starts_with("MANUAL_TOOL_EXEC|") {
                let _ = agent_2.send_message(&ack_channel, &format!("MANUAL_TOOL_RESULT|agent_2|success|{}", ack_params)).await;
                break;
            }
        }
    });

    let alive_agents = vec!["agent_1".to_string(), "agent_2".to_string()];
    let outcome = enforce_consensus(&mut enforcer, &channel, &tool_call, &alive_agents).await;
    assert!(outcome.timed_out.is_empty(), "both agents should have acked in time");

    let mut clean_params = tool_call.parameters.clone();
    if let Some(obj) = clean_params.as_object_mut() {
        obj.insert("__is_manual".into(), serde_json::Value::Bool(true));
    }
    ledger.record("agent_1", "set_name", 0x401000, clean_params.clone()).unwrap();
    ledger.record("agent_2", "set_name", 0x401000, clean_params).unwrap();

    assert!(verify_consensus_applied(&ledger, &alive_agents, 0x401000).unwrap());
}

/// §8 S4 — an agent that never writes anything is cleaned up via
/// `discard`, not `merge_agent_changes`, and zero writes counts as a no-op
/// merge rather than a failure.
#[tokio::test]
async fn orphaned_agent_with_no_writes_is_discarded_not_merged() {
    let tmp = tempfile::tempdir().unwrap();
    let source_db = tmp.path().join("prog.db");
    let source_bin = tmp.path().join("prog.bin");
    tokio::fs::write(&source_db, b"db").await.unwrap();
    tokio::fs::write(&source_bin, b"bin").await.unwrap();

    let ledger = Ledger::open_in_memory().unwrap();
    let forker = DatabaseForker::new(tmp.path().join("forks"));
    let fork = forker.fork_for_agent("agent_1", &source_db, &source_bin).await.unwrap();

    let merger = Merger::new(ledger, Arc::new(RecordingDb::new()));
    assert!(merger.has_no_writes("agent_1").unwrap());

    forker.discard("agent_1").await.unwrap();
    assert!(!fork.database_path.exists());
    assert!(forker.get_agent_database("agent_1").is_none());
}
