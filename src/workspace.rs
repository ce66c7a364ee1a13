// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-binary workspace layout (§6 "Persisted layout") and the
//! startup wipe that clears everything in it except a caller-supplied
//! allow-list (§6 "Workspace is wiped on orchestrator startup except for
//! `lldb_config.json`", generalized per SPEC_FULL.md §C.4).

use std::path::{Path, PathBuf};

/// `<workspace_root>/<binary_name>/` and its fixed subdirectories.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(workspace_root: &Path, binary_name: &str) -> Self {
        Self { root: workspace_root.join(binary_name) }
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    pub fn memories_dir(&self) -> PathBuf {
        self.root.join("memories")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("tool_calls.db")
    }

    pub fn orchestrator_log(&self) -> PathBuf {
        self.root.join("orchestrator.log")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.configs_dir())?;
        std::fs::create_dir_all(self.agents_dir())?;
        std::fs::create_dir_all(self.memories_dir())?;
        Ok(())
    }
}

/// Wipe every top-level entry under `binary_dir` except the filenames
/// listed in `preserve`, using a read-reserve / wipe / restore sequence
/// (Design Notes §9) so a crash partway through never loses a preserved
/// file's *contents*, only potentially leaves a stale copy behind.
pub fn reset_workspace(binary_dir: &Path, preserve: &[String]) -> std::io::Result<()> {
    if !binary_dir.exists() {
        return std::fs::create_dir_all(binary_dir);
    }

    let mut reserved = Vec::new();
    for name in preserve {
        let path = binary_dir.join(name);
        if path.is_file() {
            reserved.push((name.clone(), std::fs::read(&path)?));
        }
    }

    for entry in std::fs::read_dir(binary_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }

    for (name, bytes) in reserved {
        std::fs::write(binary_dir.join(name), bytes)?;
    }
    Ok(())
}
