// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use crate::{Ea, SwarmError};

/// Segment permission bits, format-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPerms {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl SegmentPerms {
    pub const RWX: Self = Self { read: true, write: true, execute: true };
    pub const RX: Self = Self { read: true, write: false, execute: true };
}

/// The bytes and disassembly text for one previewed range (§4.4 stage 2).
#[derive(Debug, Clone)]
pub struct DisassemblyRange {
    pub disassembly: String,
    pub bytes: Vec<u8>,
}

/// A candidate code cave found by scanning executable segments (§4.4 stage 3).
#[derive(Debug, Clone, Copy)]
pub struct CodeCave {
    pub address: Ea,
    pub file_offset: u64,
}

/// Port for the out-of-scope decompiler/disassembler/program-database
/// collaborator (§1, §9 "program-database port").
///
/// Every agent-originated mutation is expressed generically as
/// `(tool_name, address, parameters) -> result` because the ledger (C2) and
/// the merger (C5) both need to record and replay tool calls without
/// knowing the concrete set of tools a given program-database backend
/// supports. Concrete bindings (e.g. a disassembler's scripting API) own
/// the `match tool_name { ... }` dispatch behind this trait.
#[async_trait]
pub trait ProgramDatabase: Send + Sync {
    /// Execute one tool call against this database instance, returning the
    /// tool's JSON result. Used by C5 (merge replay), C11 (agent-side
    /// manual enforcement) and the consensus-enforcement path in C7.
    async fn execute(&self, tool_name: &str, address: Ea, params: &Value) -> Result<Value, SwarmError>;

    /// Address immediately after the highest existing segment, page-aligned
    /// (§4.4 stage 1 step 2).
    async fn find_safe_address_after_segments(&self) -> Result<Ea, SwarmError>;

    /// Create a named temporary segment with the given size and
    /// permissions (§4.4 stage 1 step 4).
    async fn create_temp_segment(&self, addr: Ea, size: u64, name: &str, perms: SegmentPerms) -> Result<(), SwarmError>;

    /// Remove a temporary segment created by `create_temp_segment`.
    async fn delete_temp_segment(&self, addr: Ea) -> Result<(), SwarmError>;

    /// Force re-analysis and return disassembly + raw bytes for a range
    /// (§4.4 stage 2 step 2).
    async fn analyze_range(&self, start: Ea, end: Ea) -> Result<DisassemblyRange, SwarmError>;

    /// Scan executable segments for a run of >= `needed` padding bytes not
    /// inside a live function body or a no-go zone (§4.4 stage 3 step 2).
    async fn find_code_cave(&self, needed: u64) -> Result<Option<CodeCave>, SwarmError>;
}

/// Port for the out-of-scope binary-file editor collaborator (§1). Kept
/// separate from `ProgramDatabase` because it operates on the on-disk file
/// (file offsets, segment tables) rather than the in-memory analysis
/// database, matching the split in §4.4 stage 3 between "write bytes to the
/// binary file" and "add it to the binary using the binary-editor
/// collaborator".
#[async_trait]
pub trait BinaryEditor: Send + Sync {
    /// Write `bytes` at `file_offset` in the agent's (or main) binary copy.
    async fn write_bytes_at_offset(&self, file_offset: u64, bytes: &[u8]) -> Result<(), SwarmError>;

    /// Add a new permanent segment containing `bytes`, honoring the
    /// format's name-length limit (PE <= 8 chars, Mach-O <= 16, ELF
    /// unrestricted — §4.4 stage 3 step 3). Returns the address the new
    /// segment was mapped at.
    async fn add_segment(&self, name: &str, bytes: &[u8]) -> Result<Ea, SwarmError>;

    /// Copy the binary file to `dest_path` (used by C5 to fork per-agent
    /// binary copies).
    async fn copy_to(&self, dest_path: &str) -> Result<(), SwarmError>;
}
