// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C4: the code-injection allocator. A three-stage state machine —
//! `allocate_code_workspace` → `preview_code_injection` →
//! `finalize_code_injection` — that lets an agent stage new code in a
//! disposable temporary segment, inspect what it actually assembled to, and
//! only then commit it to a code cave or a permanent segment (§4.4).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use swarm_core::ports::{BinaryEditor, ProgramDatabase, SegmentPerms};
use swarm_core::{Ea, SwarmError, Workspace};
use swarm_ledger::{LedgerHandle, NoGoZoneRegistry};
use swarm_core::NoGoZoneType;
use tracing::{debug, info};

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

/// Stage 2's cached result: what got written into a workspace and what it
/// disassembled to, kept around so stage 3 can finalize without redoing the
/// analysis.
#[derive(Debug, Clone)]
struct PreviewRecord {
    bytes: Vec<u8>,
    disassembly: String,
}

/// How `finalize_code_injection` committed a previewed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeMethod {
    CodeCave,
    NewSegment,
}

pub struct CodeInjector {
    db: Arc<dyn ProgramDatabase>,
    editor: Arc<dyn BinaryEditor>,
    nogo: Arc<NoGoZoneRegistry>,
    ledger: LedgerHandle,
    workspaces: Mutex<HashMap<Ea, Workspace>>,
    previews: Mutex<HashMap<Ea, PreviewRecord>>,
}

impl CodeInjector {
    pub fn new(db: Arc<dyn ProgramDatabase>, editor: Arc<dyn BinaryEditor>, nogo: Arc<NoGoZoneRegistry>, ledger: LedgerHandle) -> Self {
        Self { db, editor, nogo, ledger, workspaces: Mutex::new(HashMap::new()), previews: Mutex::new(HashMap::new()) }
    }

    /// Stage 1. Reserve `requested_size` bytes of scratch space, oversized
    /// by 50% to absorb the assembler's own slack (mirrors the original
    /// allocator's `actual_size = align_up(requested * 1.5, 0x1000)`), and
    /// register it as a no-go zone so sibling agents don't collide with it.
    pub async fn allocate_code_workspace(&self, agent_id: &str, requested_size: u64) -> Result<Workspace, SwarmError> {
        let actual_size = align_up(requested_size + requested_size / 2, 0x1000);

        let hint = self.db.find_safe_address_after_segments().await?;
        let start = self.nogo.find_safe_allocation(hint, actual_size)?;
        let end = start.checked_add(actual_size).ok_or(SwarmError::NoSafeAddress { size: actual_size })?;

        let segment_name = format!("swarm_tmp_{agent_id}_{start:x}");
        self.db.create_temp_segment(start, actual_size, &segment_name, SegmentPerms::RWX).await?;
        self.nogo.add_zone(swarm_core::NoGoZone::new(start, end, agent_id.to_string(), NoGoZoneType::TempSegment));

        // §4.3 broadcast protocol: C9 watches the ledger for this exact tool
        // name and re-publishes the zone to `#agents` so sibling agents can
        // register it locally too.
        self.ledger.record(agent_id, "allocate_code_workspace", start, json!({ "end": end }))?;

        let workspace = Workspace { start, end, size: actual_size, segment_name, is_temporary: true };
        self.workspaces.lock().expect("injector mutex poisoned").insert(start, workspace.clone());

        info!(agent_id, start = %format!("{start:#x}"), size = actual_size, "allocated code workspace");
        Ok(workspace)
    }

    /// Stage 2. Write `bytes` at `offset` into a previously allocated
    /// workspace and force re-analysis so the agent can inspect the
    /// resulting disassembly before committing to it (§4.4 stage 2).
    pub async fn preview_code_injection(&self, workspace_start: Ea, offset: u64, bytes: &[u8]) -> Result<String, SwarmError> {
        let workspace = {
            let workspaces = self.workspaces.lock().expect("injector mutex poisoned");
            workspaces.get(&workspace_start).cloned().ok_or(SwarmError::InjectionRangeInvalid { start: workspace_start, end: workspace_start })?
        };

        let write_addr = workspace_start.checked_add(offset).ok_or(SwarmError::InjectionRangeInvalid { start: workspace_start, end: workspace_start })?;
        let write_end = write_addr.checked_add(bytes.len() as u64).ok_or(SwarmError::InjectionRangeInvalid { start: write_addr, end: write_addr })?;
        if write_addr < workspace.start || write_end > workspace.end {
            return Err(SwarmError::InjectionRangeInvalid { start: write_addr, end: write_end });
        }

        self.db.execute("patch_bytes", write_addr, &json!({ "bytes": hex::encode(bytes) })).await?;
        let range = self.db.analyze_range(write_addr, write_end).await?;

        self.previews.lock().expect("injector mutex poisoned").insert(
            workspace_start,
            PreviewRecord { bytes: range.bytes.clone(), disassembly: range.disassembly.clone() },
        );
        Ok(range.disassembly)
    }

    /// Stage 3. Commit a previewed workspace to a permanent location: a
    /// code cave if one is big enough, otherwise a brand new segment
    /// (§4.4 stage 3). Deletes the temporary segment and frees its no-go
    /// reservation either way.
    pub async fn finalize_code_injection(&self, agent_id: &str, workspace_start: Ea) -> Result<(Ea, Ea, FinalizeMethod), SwarmError> {
        let preview = {
            let previews = self.previews.lock().expect("injector mutex poisoned");
            previews.get(&workspace_start).cloned().ok_or(SwarmError::InjectionRangeInvalid { start: workspace_start, end: workspace_start })?
        };

        let (new_address, method) = match self.db.find_code_cave(preview.bytes.len() as u64).await? {
            Some(cave) => {
                self.editor.write_bytes_at_offset(cave.file_offset, &preview.bytes).await?;
                // §4.3: a code cave is itself a no-go zone once occupied, so
                // record it the same way `allocate_code_workspace` does for
                // C9 to pick up and broadcast.
                let cave_end = cave.address.checked_add(preview.bytes.len() as u64).unwrap_or(cave.address);
                self.ledger.record(agent_id, "finalize_code_injection", cave.address, json!({ "end": cave_end }))?;
                (cave.address, FinalizeMethod::CodeCave)
            }
            None => {
                let segment_name = format!("sw{agent_id}");
                let address = self.editor.add_segment(&segment_name, &preview.bytes).await?;
                (address, FinalizeMethod::NewSegment)
            }
        };

        self.db.delete_temp_segment(workspace_start).await?;
        self.nogo.remove_agent_zones(agent_id);
        self.workspaces.lock().expect("injector mutex poisoned").remove(&workspace_start);
        self.previews.lock().expect("injector mutex poisoned").remove(&workspace_start);

        debug!(agent_id, old = %format!("{workspace_start:#x}"), new = %format!("{new_address:#x}"), ?method, "finalized code injection");
        Ok((workspace_start, new_address, method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use swarm_core::ports::{CodeCave, DisassemblyRange};
    use swarm_core::Ea;

    struct FakeDb {
        next_free: AtomicU64,
        cave: Option<CodeCave>,
    }

    #[async_trait]
    impl ProgramDatabase for FakeDb {
        async fn execute(&self, _tool_name: &str, _address: Ea, _params: &serde_json::Value) -> Result<serde_json::Value, SwarmError> {
            Ok(serde_json::Value::Null)
        }
        async fn find_safe_address_after_segments(&self) -> Result<Ea, SwarmError> {
            Ok(self.next_free.load(Ordering::SeqCst))
        }
        async fn create_temp_segment(&self, _addr: Ea, _size: u64, _name: &str, _perms: SegmentPerms) -> Result<(), SwarmError> {
            Ok(())
        }
        async fn delete_temp_segment(&self, _addr: Ea) -> Result<(), SwarmError> {
            Ok(())
        }
        async fn analyze_range(&self, _start: Ea, _end: Ea) -> Result<DisassemblyRange, SwarmError> {
            Ok(DisassemblyRange { disassembly: "nop".into(), bytes: vec![0x90, 0x90] })
        }
        async fn find_code_cave(&self, _needed: u64) -> Result<Option<CodeCave>, SwarmError> {
            Ok(self.cave)
        }
    }

    struct FakeEditor;

    #[async_trait]
    impl BinaryEditor for FakeEditor {
        async fn write_bytes_at_offset(&self, _file_offset: u64, _bytes: &[u8]) -> Result<(), SwarmError> {
            Ok(())
        }
        async fn add_segment(&self, _name: &str, _bytes: &[u8]) -> Result<Ea, SwarmError> {
            Ok(0x500000)
        }
        async fn copy_to(&self, _dest_path: &str) -> Result<(), SwarmError> {
            Ok(())
        }
    }

    fn injector(cave: Option<CodeCave>) -> CodeInjector {
        let db = Arc::new(FakeDb { next_free: AtomicU64::new(0x400000), cave });
        let editor = Arc::new(FakeEditor);
        let ledger = swarm_ledger::Ledger::open_in_memory().unwrap();
        CodeInjector::new(db, editor, Arc::new(NoGoZoneRegistry::new()), ledger)
    }

    #[tokio::test]
    async fn allocate_oversizes_and_reserves_a_zone() {
        let injector = injector(None);
        let ws = injector.allocate_code_workspace("agent_1", 0x1000).await.unwrap();
        assert_eq!(ws.size, 0x2000); // 0x1000 * 1.5, aligned up
        assert!(injector.nogo.is_no_go(ws.start));
    }

    #[tokio::test]
    async fn allocate_records_a_ledger_row_for_the_orchestrator_to_broadcast() {
        let injector = injector(None);
        let ws = injector.allocate_code_workspace("agent_1", 0x10).await.unwrap();

        let calls = injector.ledger.get_agent_tool_calls("agent_1").unwrap();
        let call = calls.iter().find(|c| c.tool_name == "allocate_code_workspace").unwrap();
        assert_eq!(call.address, ws.start);
        assert_eq!(call.parameters["end"], ws.end);
    }

    #[tokio::test]
    async fn finalize_to_a_code_cave_records_a_ledger_row_too() {
        let cave = CodeCave { address: 0x777000, file_offset: 0x1000 };
        let injector = injector(Some(cave));
        let ws = injector.allocate_code_workspace("agent_1", 0x10).await.unwrap();
        injector.preview_code_injection(ws.start, 0, &[0x90, 0x90]).await.unwrap();
        injector.finalize_code_injection("agent_1", ws.start).await.unwrap();

        let calls = injector.ledger.get_agent_tool_calls("agent_1").unwrap();
        let call = calls.iter().find(|c| c.tool_name == "finalize_code_injection").unwrap();
        assert_eq!(call.address, 0x777000);
        assert_eq!(call.parameters["end"], 0x777002);
    }

    #[tokio::test]
    async fn finalize_without_preview_errors() {
        let injector = injector(None);
        let ws = injector.allocate_code_workspace("agent_1", 0x100).await.unwrap();
        let err = injector.finalize_code_injection("agent_1", ws.start).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn finalize_prefers_code_cave_when_available() {
        let cave = CodeCave { address: 0x777000, file_offset: 0x1000 };
        let injector = injector(Some(cave));
        let ws = injector.allocate_code_workspace("agent_1", 0x10).await.unwrap();
        injector.preview_code_injection(ws.start, 0, &[0x90, 0x90]).await.unwrap();

        let (_old, new_addr, method) = injector.finalize_code_injection("agent_1", ws.start).await.unwrap();
        assert_eq!(new_addr, 0x777000);
        assert_eq!(method, FinalizeMethod::CodeCave);
        assert!(!injector.nogo.is_no_go(ws.start));
    }

    #[tokio::test]
    async fn finalize_falls_back_to_new_segment_without_a_cave() {
        let injector = injector(None);
        let ws = injector.allocate_code_workspace("agent_1", 0x10).await.unwrap();
        injector.preview_code_injection(ws.start, 0, &[0x90]).await.unwrap();

        let (_old, new_addr, method) = injector.finalize_code_injection("agent_1", ws.start).await.unwrap();
        assert_eq!(new_addr, 0x500000);
        assert_eq!(method, FinalizeMethod::NewSegment);
    }

    #[tokio::test]
    async fn preview_rejects_writes_outside_the_workspace() {
        let injector = injector(None);
        let ws = injector.allocate_code_workspace("agent_1", 0x10).await.unwrap();
        let err = injector.preview_code_injection(ws.start, ws.size + 1, &[0x90]).await;
        assert!(err.is_err());
    }
}
