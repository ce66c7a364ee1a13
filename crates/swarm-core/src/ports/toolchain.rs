// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use crate::SwarmError;

/// Port for the out-of-scope C-compilation -> object-file -> machine-code
/// pipeline used by semantic patching (§1). The core orchestration runtime
/// never calls this directly; it exists so agent-side semantic-patch
/// tooling (outside this core's scope) has a stable seam to compile against
/// without coupling the orchestration crates to a concrete toolchain.
#[async_trait]
pub trait NativeToolchain: Send + Sync {
    /// Compile `c_source` for the target's architecture/ABI and return the
    /// resulting machine code ready for injection.
    async fn compile_to_machine_code(&self, c_source: &str) -> Result<Vec<u8>, SwarmError>;
}
