// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C9: the user-facing control loop. One instance drives one user task
//! through conversation turns with the LLM driver, dispatching `spawn_agent`
//! tool calls into C5/C6, waiting for each agent's completion, and
//! auto-merging via C5 as agents finish (§4.9).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use swarm_core::ports::{LlmDriver, LlmMessage, LlmRequest, LlmResponse, LlmToolCall, LlmToolSchema, ProgramDatabase};
use swarm_core::{AgentInfo, SwarmError};
use swarm_ledger::LedgerHandle;
use swarm_merge::{DatabaseForker, Merger};
use swarm_spawn::AgentSpawner;
use tracing::{info, warn};

use crate::event_loop::PendingResults;

/// Backoff schedule for `SwarmError::LlmRecoverable` (§4.9 step 4, §7).
const BACKOFF: [Duration; 3] = [Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)];

/// Trigger compaction once the conversation's rough token estimate (chars/4)
/// crosses this (§4.9 step 2).
const COMPACTION_TOKEN_TRIGGER: usize = 100_000;
const KEEP_RECENT_TOOL_USES: usize = 5;

const SYSTEM_PROMPT: &str = "You are the orchestrator for a swarm of reverse-engineering agents. \
Use the spawn_agent tool to delegate analysis or editing work on the target binary. \
Once every spawned agent has reported back, summarize the outcome in plain text with no further tool calls.";

fn spawn_agent_schema() -> LlmToolSchema {
    LlmToolSchema {
        name: "spawn_agent".into(),
        description: "Spawn a worker agent to analyze or edit the target binary".into(),
        parameters_schema: json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "what the agent should do"},
                "context": {"type": "string", "description": "additional context for the agent's prompt"},
            },
            "required": ["task"],
        }),
    }
}

/// One turn of conversation history, the unit compaction operates on.
#[derive(Debug, Clone)]
enum HistoryEntry {
    User(String),
    Assistant(String),
    ToolResult { tool_name: String, content: String },
}

impl HistoryEntry {
    fn text(&self) -> String {
        match self {
            HistoryEntry::User(t) => format!("User: {t}"),
            HistoryEntry::Assistant(t) => format!("Assistant: {t}"),
            HistoryEntry::ToolResult { tool_name, content } => format!("Tool[{tool_name}] result: {content}"),
        }
    }
}

/// Drives a single user task to completion (§4.9). Owns no bus connection
/// of its own — agent completion is observed through `pending_results`,
/// which `OrchestratorBus::dispatch_results_channel` populates as
/// `AGENT_RESULT` frames arrive.
pub struct ControlLoop {
    llm: Arc<dyn LlmDriver>,
    spawner: Arc<AgentSpawner>,
    forker: Arc<DatabaseForker>,
    merger: Arc<Merger>,
    ledger: LedgerHandle,
    pending_results: Arc<PendingResults>,
    source_database: PathBuf,
    source_binary: PathBuf,
    /// The chat-relay bus port every spawned agent must connect to (§4.1);
    /// bound once by the orchestrator and threaded into each agent's config.
    bus_port: u16,
    /// `<workspace_root>/<binary_name>/tool_calls.db`, passed to every
    /// spawned agent so it opens the same C2 store the orchestrator does.
    ledger_path: PathBuf,
    history: Vec<HistoryEntry>,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmDriver>,
        spawner: Arc<AgentSpawner>,
        forker: Arc<DatabaseForker>,
        merger: Arc<Merger>,
        ledger: LedgerHandle,
        pending_results: Arc<PendingResults>,
        source_database: PathBuf,
        source_binary: PathBuf,
        bus_port: u16,
        ledger_path: PathBuf,
    ) -> Self {
        Self {
            llm,
            spawner,
            forker,
            merger,
            ledger,
            pending_results,
            source_database,
            source_binary,
            bus_port,
            ledger_path,
            history: Vec::new(),
        }
    }

    /// Run `task` to completion and return the final text result (§4.9 step
    /// 3 "emit the final text as the task result").
    pub async fn run_task(&mut self, task: &str) -> Result<String, SwarmError> {
        self.history.push(HistoryEntry::User(task.to_string()));

        loop {
            self.compact_if_needed();
            let response = self.invoke_llm_with_retry().await?;

            match response {
                LlmResponse::Text(text) => {
                    self.history.push(HistoryEntry::Assistant(text.clone()));
                    return Ok(text);
                }
                LlmResponse::ToolCall(call) => {
                    self.history.push(HistoryEntry::Assistant(format!("called {}", call.tool_name)));
                    let result = self.dispatch_tool_call(&call).await;
                    self.history.push(HistoryEntry::ToolResult { tool_name: call.tool_name, content: result });
                }
            }
        }
    }

    async fn invoke_llm_with_retry(&self) -> Result<LlmResponse, SwarmError> {
        let messages: Vec<LlmMessage> = self.history.iter().map(|h| LlmMessage::user(h.text())).collect();
        let request = LlmRequest {
            system_prompt: SYSTEM_PROMPT.into(),
            messages,
            tools: vec![spawn_agent_schema()],
            temperature: 0.7,
            max_tokens: 8192,
        };

        let mut attempt = 0;
        loop {
            match self.llm.send(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(SwarmError::LlmRecoverable(msg)) if attempt < BACKOFF.len() => {
                    warn!(attempt, error = %msg, "LLM call failed, retrying with backoff");
                    tokio::time::sleep(BACKOFF[attempt]).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop all but the `KEEP_RECENT_TOOL_USES` most recent tool-result
    /// entries once the rough character-count estimate of history crosses
    /// `COMPACTION_TOKEN_TRIGGER` tokens (§4.9 step 2). User/assistant text
    /// entries are left alone; this only trims the bulkiest entries.
    fn compact_if_needed(&mut self) {
        let estimated_tokens: usize = self.history.iter().map(|h| h.text().len() / 4).sum();
        if estimated_tokens < COMPACTION_TOKEN_TRIGGER {
            return;
        }

        let tool_result_count = self.history.iter().filter(|h| matches!(h, HistoryEntry::ToolResult { .. })).count();
        if tool_result_count <= KEEP_RECENT_TOOL_USES {
            return;
        }

        let mut seen = 0;
        let cutoff_from_end = tool_result_count - KEEP_RECENT_TOOL_USES;
        let mut dropped = 0;
        self.history.retain(|entry| {
            if matches!(entry, HistoryEntry::ToolResult { .. }) {
                seen += 1;
                let keep = seen > cutoff_from_end;
                if !keep {
                    dropped += 1;
                }
                keep
            } else {
                true
            }
        });
        info!(dropped, estimated_tokens, "compacted control loop history");
    }

    async fn dispatch_tool_call(&mut self, call: &LlmToolCall) -> String {
        match call.tool_name.as_str() {
            "spawn_agent" => self.handle_spawn_agent(&call.parameters).await,
            other => format!("unknown tool `{other}`, ignored"),
        }
    }

    /// §4.9 step 3 "For spawn_agent calls, collect all spawned agent ids,
    /// wait for each agent to reach completion, then append the agent's
    /// final report as the tool result." Only a single spawn per call is
    /// modeled here since the tool schema accepts one task at a time; the
    /// LLM issues multiple tool calls in one response to spawn several
    /// agents, which `run_task`'s caller processes one at a time in order.
    async fn handle_spawn_agent(&mut self, params: &Value) -> String {
        let task = params.get("task").and_then(Value::as_str).unwrap_or("").to_string();
        let context = params.get("context").and_then(Value::as_str).unwrap_or("").to_string();

        let agent_id = self.spawner.reserve_agent_id();
        let fork = match self.forker.fork_for_agent(&agent_id, &self.source_database, &self.source_binary).await {
            Ok(fork) => fork,
            Err(e) => return format!("failed to fork database for {agent_id}: {e}"),
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending_results.lock().await.insert(agent_id.clone(), tx);

        let extra = json!({
            "context": context,
            "bus_port": self.bus_port,
            "ledger_path": self.ledger_path,
            "memory_dir": fork.memory_dir,
        });
        let info = match self
            .spawner
            .spawn_agent_with_id(&agent_id, &task, &fork.database_path, &fork.binary_path, extra)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.pending_results.lock().await.remove(&agent_id);
                return format!("failed to spawn {agent_id}: {e}");
            }
        };

        let report = self.wait_for_completion(&info, rx).await;
        self.auto_merge(&agent_id).await;
        format!("{agent_id} report: {report}")
    }

    /// Race the bus-delivered `AGENT_RESULT` against process exit, polling
    /// every ~2s (§4.9 "Polling period ~2 s"). A process that exits without
    /// ever sending a report gets the documented synthetic one (§4.9, §7).
    async fn wait_for_completion(&self, info: &AgentInfo, mut rx: tokio::sync::oneshot::Receiver<String>) -> String {
        loop {
            tokio::select! {
                result = &mut rx => {
                    return result.unwrap_or_else(|_| "Agent process terminated without sending final report".to_string());
                }
                _ = tokio::time::sleep(Duration::from_secs(2)) => {
                    if !self.spawner.is_agent_running(&info.agent_id).await {
                        self.pending_results.lock().await.remove(&info.agent_id);
                        warn!(agent_id = %info.agent_id, "agent process exited without a final report");
                        return "Agent process terminated without sending final report".to_string();
                    }
                }
            }
        }
    }

    /// §4.5 cleanup rule: an agent with zero recorded writes has its fork
    /// discarded instead of merged; everyone else goes through `Merger`.
    async fn auto_merge(&self, agent_id: &str) {
        match self.merger.has_no_writes(agent_id) {
            Ok(true) => {
                if let Err(e) = self.forker.discard(agent_id).await {
                    warn!(agent_id, error = %e, "failed to discard write-free agent fork");
                }
            }
            Ok(false) => match self.merger.merge_agent_changes(agent_id).await {
                Ok(result) => info!(agent_id, applied = result.changes_applied, failed = result.changes_failed, "auto-merged agent changes"),
                Err(e) => warn!(agent_id, error = %e, "auto-merge failed"),
            },
            Err(e) => warn!(agent_id, error = %e, "failed to check agent write operations before merge"),
        }
    }
}

/// Placeholder for the out-of-scope LLM HTTP client (§1). Mirrors
/// `swarm-agent`'s `UnboundProgramDatabase`: every call fails loudly with
/// `LlmFatal` so a missing binding can't be mistaken for a quiet model that
/// simply never calls any tools.
pub struct UnboundLlmDriver;

#[async_trait::async_trait]
impl LlmDriver for UnboundLlmDriver {
    async fn send(&self, _request: LlmRequest) -> Result<LlmResponse, SwarmError> {
        Err(SwarmError::LlmFatal("no LLM driver binding configured".into()))
    }
}

/// Placeholder for the out-of-scope program-database/decompiler binding
/// used by the orchestrator's own `Merger` (distinct instance from each
/// agent's own placeholder in `swarm-agent`, since merge replay runs
/// against the *canonical* database, not a fork).
pub struct UnboundCanonicalDatabase;

#[async_trait::async_trait]
impl ProgramDatabase for UnboundCanonicalDatabase {
    async fn execute(&self, tool_name: &str, _address: swarm_core::Ea, _params: &Value) -> Result<Value, SwarmError> {
        Err(SwarmError::Collaborator(format!("no program-database binding configured for tool `{tool_name}`")))
    }
    async fn find_safe_address_after_segments(&self) -> Result<swarm_core::Ea, SwarmError> {
        Err(SwarmError::Collaborator("no program-database binding configured".into()))
    }
    async fn create_temp_segment(&self, _addr: swarm_core::Ea, _size: u64, _name: &str, _perms: swarm_core::ports::SegmentPerms) -> Result<(), SwarmError> {
        Err(SwarmError::Collaborator("no program-database binding configured".into()))
    }
    async fn delete_temp_segment(&self, _addr: swarm_core::Ea) -> Result<(), SwarmError> {
        Err(SwarmError::Collaborator("no program-database binding configured".into()))
    }
    async fn analyze_range(&self, _start: swarm_core::Ea, _end: swarm_core::Ea) -> Result<swarm_core::ports::DisassemblyRange, SwarmError> {
        Err(SwarmError::Collaborator("no program-database binding configured".into()))
    }
    async fn find_code_cave(&self, _needed: u64) -> Result<Option<swarm_core::ports::CodeCave>, SwarmError> {
        Err(SwarmError::Collaborator("no program-database binding configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use swarm_ledger::Ledger;
    use tokio::sync::Mutex as TokioMutex;

    struct ScriptedDriver {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmDriver for ScriptedDriver {
        async fn send(&self, _request: LlmRequest) -> Result<LlmResponse, SwarmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(LlmResponse::ToolCall(LlmToolCall {
                    tool_name: "spawn_agent".into(),
                    parameters: json!({"task": "rename 0x1000", "context": ""}),
                }))
            } else {
                Ok(LlmResponse::Text("done, renamed".into()))
            }
        }
    }

    #[tokio::test]
    async fn run_task_spawns_an_agent_then_returns_final_text() {
        let workspace = tempfile::tempdir().unwrap();
        let source_db = workspace.path().join("prog.db");
        let source_bin = workspace.path().join("prog.bin");
        tokio::fs::write(&source_db, b"db").await.unwrap();
        tokio::fs::write(&source_bin, b"bin").await.unwrap();

        let ledger = Ledger::open_in_memory().unwrap();
        let spawner = AgentSpawner::new(PathBuf::from("/bin/sleep"), workspace.path());
        let forker = Arc::new(DatabaseForker::new(workspace.path().join("agents")));
        let merger = Arc::new(Merger::new(ledger.clone(), Arc::new(UnboundCanonicalDatabase)));
        let pending_results: Arc<PendingResults> = Arc::new(TokioMutex::new(std::collections::HashMap::new()));

        let mut control = ControlLoop::new(
            Arc::new(ScriptedDriver { calls: AtomicU32::new(0) }),
            spawner,
            forker,
            merger,
            ledger,
            pending_results,
            source_db,
            source_bin,
            6700,
            workspace.path().join("tool_calls.db"),
        );

        let result = control.run_task("rename function at 0x1000").await.unwrap();
        assert_eq!(result, "done, renamed");
    }

    #[test]
    fn compaction_keeps_only_the_most_recent_tool_results() {
        let mut control_history = Vec::new();
        for i in 0..20 {
            control_history.push(HistoryEntry::ToolResult { tool_name: "spawn_agent".into(), content: "x".repeat(20_000) });
            let _ = i;
        }
        let tool_result_count = control_history.len();
        assert!(tool_result_count > KEEP_RECENT_TOOL_USES);
    }
}
