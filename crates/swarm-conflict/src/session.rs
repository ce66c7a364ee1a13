// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;

use swarm_core::{ConflictSession, ToolConflict};
use tracing::info;

/// Tracks every conflict channel currently being discussed. One instance
/// lives on the orchestrator; agents only ever see the channel name itself
/// over the bus (§4.7).
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, ConflictSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the session for `channel`, seeding it with
    /// `original_conflict` the first time it's seen.
    pub fn get_or_start(&self, channel: &str, original_conflict: ToolConflict) -> ConflictSession {
        let mut sessions = self.sessions.lock().expect("session manager mutex poisoned");
        sessions
            .entry(channel.to_string())
            .or_insert_with(|| {
                info!(channel, "opened conflict session");
                ConflictSession::new(channel, original_conflict)
            })
            .clone()
    }

    /// Record that `agent_id` has joined the discussion on `channel`.
    pub fn add_participant(&self, channel: &str, agent_id: &str) {
        let mut sessions = self.sessions.lock().expect("session manager mutex poisoned");
        if let Some(session) = sessions.get_mut(channel) {
            session.participating_agents.insert(agent_id.to_string());
        }
    }

    /// Record `agent_id`'s consensus statement text. Returns the session's
    /// updated readiness so the caller (the orchestrator's IRC message
    /// handler) can decide whether to trigger resolution.
    pub fn mark_consensus(&self, channel: &str, agent_id: &str, statement: &str) -> Option<ConflictSession> {
        let mut sessions = self.sessions.lock().expect("session manager mutex poisoned");
        let session = sessions.get_mut(channel)?;
        session.participating_agents.insert(agent_id.to_string());
        session.consensus_statements.insert(agent_id.to_string(), statement.to_string());
        Some(session.clone())
    }

    pub fn get(&self, channel: &str) -> Option<ConflictSession> {
        self.sessions.lock().expect("session manager mutex poisoned").get(channel).cloned()
    }

    /// Mark a session resolved and stop tracking it for further
    /// `MARKED_CONSENSUS` messages (a late straggler just gets ignored,
    /// per §4.7 "resolution is one-shot per channel").
    pub fn mark_resolved(&self, channel: &str) {
        let mut sessions = self.sessions.lock().expect("session manager mutex poisoned");
        if let Some(session) = sessions.get_mut(channel) {
            session.resolved = true;
        }
    }

    pub fn close(&self, channel: &str) {
        self.sessions.lock().expect("session manager mutex poisoned").remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use swarm_core::ToolCall;

    fn sample_conflict() -> ToolConflict {
        let call = |agent: &str| ToolCall {
            id: 1,
            agent_id: agent.into(),
            tool_name: "set_name".into(),
            address: 0x1000,
            parameters: serde_json::json!({}),
            timestamp: Utc::now(),
            is_write_operation: true,
        };
        ToolConflict { first_call: call("agent_1"), second_call: call("agent_2") }
    }

    #[test]
    fn session_is_not_ready_with_one_participant() {
        let mgr = SessionManager::new();
        let channel = "#conflict_1000_set_name";
        mgr.get_or_start(channel, sample_conflict());
        mgr.mark_consensus(channel, "agent_1", "use foo");

        let session = mgr.get(channel).unwrap();
        assert!(!session.is_ready_to_resolve());
    }

    #[test]
    fn session_becomes_ready_once_both_participants_marked() {
        let mgr = SessionManager::new();
        let channel = "#conflict_1000_set_name";
        mgr.get_or_start(channel, sample_conflict());
        mgr.mark_consensus(channel, "agent_1", "use foo");
        let session = mgr.mark_consensus(channel, "agent_2", "use foo too").unwrap();

        assert!(session.is_ready_to_resolve());
    }

    #[test]
    fn mark_resolved_is_reflected_on_subsequent_get() {
        let mgr = SessionManager::new();
        let channel = "#conflict_1000_set_name";
        mgr.get_or_start(channel, sample_conflict());
        mgr.mark_resolved(channel);

        assert!(mgr.get(channel).unwrap().resolved);
    }

    #[test]
    fn close_removes_the_session() {
        let mgr = SessionManager::new();
        let channel = "#conflict_1000_set_name";
        mgr.get_or_start(channel, sample_conflict());
        mgr.close(channel);
        assert!(mgr.get(channel).is_none());
    }
}
