// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Collaborator ports.
//!
//! spec.md §1 names several subsystems as external collaborators with only
//! their interfaces specified: the LLM HTTP client, the program database /
//! binary-file editor, and the native-compilation toolchain. The Design
//! Notes (§9) call for isolating these behind explicit trait "ports" rather
//! than the raw pointers / hidden singletons the original C++ used.
//!
//! Every `swarm-*` crate that needs one of these collaborators takes it as
//! `Arc<dyn Trait>` (or a generic bound in hot paths) rather than depending
//! on a concrete decompiler or HTTP crate. Production wiring (choosing the
//! real decompiler binding, the real Anthropic/OpenAI client, the real
//! native toolchain) happens at the two binaries' composition root and is
//! out of scope for this core.

mod llm;
mod program_db;
mod toolchain;

pub use llm::{LlmDriver, LlmMessage, LlmRequest, LlmResponse, LlmToolCall, LlmToolSchema};
pub use program_db::{BinaryEditor, CodeCave, DisassemblyRange, ProgramDatabase, SegmentPerms};
pub use toolchain::NativeToolchain;
