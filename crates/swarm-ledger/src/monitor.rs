// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use tracing::{debug, warn};

use crate::ledger::LedgerHandle;

/// How often the monitor thread polls `calls_since` (§4.2, §5 "2 s for
/// completion checks" governs the agent-completion poll; the ledger monitor
/// itself is not given an explicit period, so this mirrors the other
/// steady-state polling cadence used elsewhere in the control plane).
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A live `start_monitoring()` session (§4.2). Dropping this stops nothing
/// by itself — the background thread keeps running until the ledger handle
/// it holds is the last reference and the process exits, or `stop` is
/// called. Call `stop()` to have it exit its poll loop at the next tick.
pub struct LedgerMonitor {
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl LedgerMonitor {
    /// Spawn the background polling thread and return the monitor handle
    /// plus the channel new rows are delivered on, one `ToolCall` per row,
    /// in `id` order (§4.2 "emits one TOOL_CALL event per new row").
    ///
    /// Uses a plain OS thread rather than a tokio task, matching the
    /// "long-lived OS thread" style the concurrency model calls for (§5);
    /// the channel bridges back into async code with `blocking_send`.
    pub fn start(ledger: LedgerHandle) -> (Self, tokio::sync::mpsc::Receiver<swarm_core::ToolCall>) {
        Self::start_with_interval(ledger, DEFAULT_POLL_INTERVAL)
    }

    pub fn start_with_interval(ledger: LedgerHandle, poll_interval: Duration) -> (Self, tokio::sync::mpsc::Receiver<swarm_core::ToolCall>) {
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::spawn(move || {
            let mut last_seen = ledger.last_id().unwrap_or(0);
            while !stop_flag.load(std::sync::atomic::Ordering::Relaxed) {
                match ledger.calls_since(last_seen) {
                    Ok(rows) => {
                        for call in rows {
                            last_seen = last_seen.max(call.id);
                            debug!(id = call.id, tool = %call.tool_name, "ledger monitor observed new row");
                            if tx.blocking_send(call).is_err() {
                                // Receiver dropped; nothing left to do.
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "ledger monitor poll failed, will retry"),
                }
                std::thread::sleep(poll_interval);
            }
        });

        (Self { stop, handle: Some(handle) }, rx)
    }

    /// Signal the poll loop to exit at its next wake-up and join the thread.
    pub fn stop(mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
