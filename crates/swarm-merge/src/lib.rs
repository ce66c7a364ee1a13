// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C5: per-agent database/binary forking on spawn, and ledger-ordered merge
//! of an agent's write operations back into the canonical program once it
//! completes (§4.5).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use swarm_core::ports::ProgramDatabase;
use swarm_core::SwarmError;
use swarm_ledger::LedgerHandle;
use tracing::{info, warn};

/// Where an agent's private copy of the database and binary live on disk.
#[derive(Debug, Clone)]
pub struct ForkPaths {
    pub database_path: PathBuf,
    pub binary_path: PathBuf,
    pub memory_dir: PathBuf,
}

/// Creates and tracks per-agent forks of the canonical database and binary
/// file, so each agent can mutate its own copy without touching the
/// original or another agent's view until merge time.
pub struct DatabaseForker {
    base_dir: PathBuf,
    forks: Mutex<HashMap<String, ForkPaths>>,
}

impl DatabaseForker {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into(), forks: Mutex::new(HashMap::new()) }
    }

    /// Copy `source_database` and `source_binary` into a fresh directory
    /// dedicated to `agent_id` and remember the resulting paths.
    pub async fn fork_for_agent(
        &self,
        agent_id: &str,
        source_database: &Path,
        source_binary: &Path,
    ) -> Result<ForkPaths, SwarmError> {
        let dir = self.base_dir.join(agent_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SwarmError::Collaborator(format!("create fork dir for {agent_id}: {e}")))?;

        let db_name = source_database.file_name().unwrap_or_default();
        let bin_name = source_binary.file_name().unwrap_or_default();
        let database_path = dir.join(db_name);
        let binary_path = dir.join(bin_name);
        let memory_dir = dir.join("memories");

        tokio::fs::copy(source_database, &database_path)
            .await
            .map_err(|e| SwarmError::Collaborator(format!("fork database for {agent_id}: {e}")))?;
        tokio::fs::copy(source_binary, &binary_path)
            .await
            .map_err(|e| SwarmError::Collaborator(format!("fork binary for {agent_id}: {e}")))?;
        tokio::fs::create_dir_all(&memory_dir)
            .await
            .map_err(|e| SwarmError::Collaborator(format!("create memory namespace for {agent_id}: {e}")))?;

        let paths = ForkPaths { database_path, binary_path, memory_dir };
        self.forks.lock().expect("forker mutex poisoned").insert(agent_id.to_string(), paths.clone());
        info!(agent_id, "forked database and binary");
        Ok(paths)
    }

    pub fn get_agent_database(&self, agent_id: &str) -> Option<PathBuf> {
        self.forks.lock().expect("forker mutex poisoned").get(agent_id).map(|p| p.database_path.clone())
    }

    pub fn get_agent_binary(&self, agent_id: &str) -> Option<PathBuf> {
        self.forks.lock().expect("forker mutex poisoned").get(agent_id).map(|p| p.binary_path.clone())
    }

    /// Remove an agent's forked database and binary, called after a
    /// successful merge or directly when an agent made zero writes. The
    /// `memories/` subdirectory is left in place either way (§4.5 "preserves
    /// its memory namespace directory").
    pub async fn discard(&self, agent_id: &str) -> Result<(), SwarmError> {
        let paths = self.forks.lock().expect("forker mutex poisoned").remove(agent_id);
        let Some(paths) = paths else { return Ok(()) };

        if paths.database_path.exists() {
            tokio::fs::remove_file(&paths.database_path)
                .await
                .map_err(|e| SwarmError::Collaborator(format!("discard database for {agent_id}: {e}")))?;
        }
        if paths.binary_path.exists() {
            tokio::fs::remove_file(&paths.binary_path)
                .await
                .map_err(|e| SwarmError::Collaborator(format!("discard binary for {agent_id}: {e}")))?;
        }
        Ok(())
    }
}

/// Outcome of replaying one agent's write operations into the canonical
/// database (§4.5).
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    pub success: bool,
    pub changes_applied: u32,
    pub changes_failed: u32,
    pub error_message: Option<String>,
    pub applied_changes: Vec<i64>,
    pub failed_changes: Vec<(i64, String)>,
}

/// Replays an agent's recorded write calls, in ascending ledger-id order,
/// against the canonical `ProgramDatabase`.
pub struct Merger {
    ledger: LedgerHandle,
    db: Arc<dyn ProgramDatabase>,
}

impl Merger {
    pub fn new(ledger: LedgerHandle, db: Arc<dyn ProgramDatabase>) -> Self {
        Self { ledger, db }
    }

    /// True when the agent produced no write operations at all, meaning its
    /// fork can simply be discarded rather than merged.
    pub fn has_no_writes(&self, agent_id: &str) -> Result<bool, SwarmError> {
        Ok(self.ledger.get_agent_write_operations(agent_id)?.is_empty())
    }

    /// Replay every write-classified call recorded for `agent_id`, in the
    /// order the ledger assigned ids, applying each through the program
    /// database port (§4.5 "merge in ledger-id order"). A single call's
    /// failure is recorded and replay continues with the rest.
    pub async fn merge_agent_changes(&self, agent_id: &str) -> Result<MergeResult, SwarmError> {
        let calls = self.ledger.get_agent_write_operations(agent_id)?;
        let mut result = MergeResult { success: true, ..Default::default() };

        for call in &calls {
            match self.db.execute(&call.tool_name, call.address, &call.parameters).await {
                Ok(_) => {
                    result.changes_applied += 1;
                    result.applied_changes.push(call.id);
                }
                Err(e) => {
                    warn!(agent_id, call_id = call.id, error = %e, "merge replay failed for one call");
                    result.changes_failed += 1;
                    result.failed_changes.push((call.id, e.to_string()));
                    result.success = false;
                }
            }
        }

        if !result.success {
            result.error_message = Some(format!("{} of {} changes failed to replay", result.changes_failed, calls.len()));
        }
        info!(agent_id, applied = result.changes_applied, failed = result.changes_failed, "merged agent changes");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use swarm_core::ports::{CodeCave, DisassemblyRange, SegmentPerms};
    use swarm_core::Ea;
    use swarm_ledger::Ledger;

    struct RecordingDb {
        fail_on: Option<Ea>,
    }

    #[async_trait]
    impl ProgramDatabase for RecordingDb {
        async fn execute(&self, _tool_name: &str, address: Ea, _params: &serde_json::Value) -> Result<serde_json::Value, SwarmError> {
            if Some(address) == self.fail_on {
                return Err(SwarmError::Collaborator("boom".into()));
            }
            Ok(serde_json::Value::Null)
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
            Ok(DisassemblyRange { disassembly: String::new(), bytes: vec![] })
        }
        async fn find_code_cave(&self, _needed: u64) -> Result<Option<CodeCave>, SwarmError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn merge_replays_writes_in_id_order_and_skips_reads() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record("agent_1", "set_name", 0x10, serde_json::json!({})).unwrap();
        ledger.record("agent_1", "get_disasm", 0x20, serde_json::json!({})).unwrap();
        ledger.record("agent_1", "set_comment", 0x30, serde_json::json!({})).unwrap();

        let merger = Merger::new(ledger, Arc::new(RecordingDb { fail_on: None }));
        let result = merger.merge_agent_changes("agent_1").await.unwrap();

        assert!(result.success);
        assert_eq!(result.changes_applied, 2);
        assert_eq!(result.changes_failed, 0);
    }

    #[tokio::test]
    async fn merge_records_partial_failures_without_aborting() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record("agent_1", "set_name", 0x10, serde_json::json!({})).unwrap();
        ledger.record("agent_1", "set_comment", 0x20, serde_json::json!({})).unwrap();

        let merger = Merger::new(ledger, Arc::new(RecordingDb { fail_on: Some(0x10) }));
        let result = merger.merge_agent_changes("agent_1").await.unwrap();

        assert!(!result.success);
        assert_eq!(result.changes_applied, 1);
        assert_eq!(result.changes_failed, 1);
        assert!(result.error_message.is_some());
    }

    #[tokio::test]
    async fn has_no_writes_true_when_agent_only_read() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record("agent_1", "get_disasm", 0x10, serde_json::json!({})).unwrap();

        let merger = Merger::new(ledger, Arc::new(RecordingDb { fail_on: None }));
        assert!(merger.has_no_writes("agent_1").unwrap());
    }

    #[tokio::test]
    async fn forker_copies_database_and_binary_into_agent_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let source_db = tmp.path().join("prog.db");
        let source_bin = tmp.path().join("prog.bin");
        tokio::fs::write(&source_db, b"db").await.unwrap();
        tokio::fs::write(&source_bin, b"bin").await.unwrap();

        let forker = DatabaseForker::new(tmp.path().join("forks"));
        let paths = forker.fork_for_agent("agent_1", &source_db, &source_bin).await.unwrap();

        assert!(paths.database_path.exists());
        assert!(paths.binary_path.exists());
        assert_eq!(forker.get_agent_database("agent_1").unwrap(), paths.database_path);
    }

    #[tokio::test]
    async fn discard_removes_the_fork_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let source_db = tmp.path().join("prog.db");
        let source_bin = tmp.path().join("prog.bin");
        tokio::fs::write(&source_db, b"db").await.unwrap();
        tokio::fs::write(&source_bin, b"bin").await.unwrap();

        let forker = DatabaseForker::new(tmp.path().join("forks"));
        let paths = forker.fork_for_agent("agent_1", &source_db, &source_bin).await.unwrap();
        forker.discard("agent_1").await.unwrap();

        assert!(!paths.database_path.exists());
        assert!(!paths.binary_path.exists());
        assert!(forker.get_agent_database("agent_1").is_none());
    }

    #[tokio::test]
    async fn fork_for_agent_creates_a_memory_namespace_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let source_db = tmp.path().join("prog.db");
        let source_bin = tmp.path().join("prog.bin");
        tokio::fs::write(&source_db, b"db").await.unwrap();
        tokio::fs::write(&source_bin, b"bin").await.unwrap();

        let forker = DatabaseForker::new(tmp.path().join("forks"));
        let paths = forker.fork_for_agent("agent_1", &source_db, &source_bin).await.unwrap();
        assert!(paths.memory_dir.is_dir());

        forker.discard("agent_1").await.unwrap();
        assert!(paths.memory_dir.is_dir(), "discard must preserve the memory namespace directory");
    }
}
