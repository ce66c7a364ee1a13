// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// The error kinds enumerated in spec.md §7, unified into one enum so every
/// crate can convert its narrower errors into a common shape at its public
/// boundary while keeping the table's local-recovery notes alongside each
/// variant.
#[derive(Debug, Error, Clone)]
pub enum SwarmError {
    /// The bus client could not connect or reconnect. Recovery: none;
    /// callers treat initialization failure as fatal.
    #[error("chat-relay bus unavailable: {0}")]
    BusUnavailable(String),

    /// `ToolCallTracker::record` failed. Recovery: logged, not retried.
    #[error("ledger write failed: {0}")]
    LedgerWriteFailed(String),

    /// Enforcement found every participant dead. Recovery: skip
    /// enforcement, send `CONSENSUS_COMPLETE`.
    #[error("conflict session {0} has no live participants")]
    ConflictStale(String),

    /// The consensus executor returned no tool call. Recovery: fall back
    /// to a `__needs_manual` record.
    #[error("consensus extraction failed: {0}")]
    ConsensusExtractionFailed(String),

    /// Enforcement replay parameters differ across agents. Recovery:
    /// warning logged, merge proceeds anyway.
    #[error("enforcement verification mismatch at {address:#x}")]
    EnforcementVerifyMismatch { address: u64 },

    /// Stage 2/3 of the injection allocator referenced an unknown key.
    /// Recovery: return failure immediately.
    #[error("invalid code injection range [{start:#x}, {end:#x})")]
    InjectionRangeInvalid { start: u64, end: u64 },

    /// The no-go zone registry could not satisfy `find_safe_allocation`.
    /// Recovery: return `BADADDR`; caller aborts.
    #[error("no safe address available for allocation of {size} bytes")]
    NoSafeAddress { size: u64 },

    /// A single write failed during merge replay. Recovery: continue with
    /// the remaining writes.
    #[error("merge replay failed for tool call {id}: {reason}")]
    MergeReplayFailed { id: i64, reason: String },

    /// EOF or parse error on the external IPC pipes. Recovery: close
    /// pipes, continue without the external driver.
    #[error("external IPC driver closed: {0}")]
    ExternalDriverClosed(String),

    /// HTTP 5xx / timeout from the LLM driver. Recovery: exponential
    /// backoff up to 3 tries.
    #[error("LLM request recoverable failure: {0}")]
    LlmRecoverable(String),

    /// Any other LLM HTTP failure. Recovery: end task, report error.
    #[error("LLM request fatal failure: {0}")]
    LlmFatal(String),

    /// Catch-all for collaborator-port failures that don't map to one of
    /// the named kinds above.
    #[error("collaborator error: {0}")]
    Collaborator(String),
}
