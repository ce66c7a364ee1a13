// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use swarm_core::{is_write_tool, AgentToolStats, SwarmError, ToolCall, ToolConflict};
use tracing::debug;

/// Owns the SQLite connection backing the tool-call ledger. Cheap to clone
/// via `LedgerHandle`; the underlying `Connection` is single-threaded so all
/// access goes through a `Mutex`, matching rusqlite's own `Send`-not-`Sync`
/// contract.
pub struct Ledger {
    conn: Mutex<Connection>,
}

/// A cloneable handle to a `Ledger`. Every crate downstream of swarm-ledger
/// (swarm-agent, swarm-conflict, the orchestrator) holds one of these rather
/// than the `Ledger` itself.
pub type LedgerHandle = Arc<Ledger>;

impl Ledger {
    /// Open (creating if absent) the ledger database at `path` and ensure
    /// its schema exists.
    pub fn open(path: &Path) -> Result<LedgerHandle, SwarmError> {
        let conn = Connection::open(path).map_err(|e| SwarmError::LedgerWriteFailed(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tool_calls (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id        TEXT NOT NULL,
                tool_name       TEXT NOT NULL,
                address         INTEGER NOT NULL,
                parameters_json TEXT NOT NULL,
                timestamp       TEXT NOT NULL,
                is_write        INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tool_calls_address_tool ON tool_calls(address, tool_name);
            CREATE INDEX IF NOT EXISTS idx_tool_calls_agent ON tool_calls(agent_id);",
        )
        .map_err(|e| SwarmError::LedgerWriteFailed(e.to_string()))?;
        Ok(Arc::new(Self { conn: Mutex::new(conn) }))
    }

    /// Open an in-memory ledger, used by tests and by short-lived agent
    /// pre-check copies that never need to survive the process.
    pub fn open_in_memory() -> Result<LedgerHandle, SwarmError> {
        let conn = Connection::open_in_memory().map_err(|e| SwarmError::LedgerWriteFailed(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE tool_calls (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id        TEXT NOT NULL,
                tool_name       TEXT NOT NULL,
                address         INTEGER NOT NULL,
                parameters_json TEXT NOT NULL,
                timestamp       TEXT NOT NULL,
                is_write        INTEGER NOT NULL
            );
            CREATE INDEX idx_tool_calls_address_tool ON tool_calls(address, tool_name);",
        )
        .map_err(|e| SwarmError::LedgerWriteFailed(e.to_string()))?;
        Ok(Arc::new(Self { conn: Mutex::new(conn) }))
    }

    /// Append a tool call and return it with its assigned ledger id. The
    /// `is_write` flag is derived from `is_write_tool`, not taken from the
    /// caller, so the ledger stays the single source of truth for what
    /// counts as a write (§4.2).
    pub fn record(
        &self,
        agent_id: &str,
        tool_name: &str,
        address: u64,
        parameters: serde_json::Value,
    ) -> Result<ToolCall, SwarmError> {
        let is_write = is_write_tool(tool_name);
        let timestamp = Utc::now();
        let params_json = parameters.to_string();

        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute(
            "INSERT INTO tool_calls (agent_id, tool_name, address, parameters_json, timestamp, is_write)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![agent_id, tool_name, address as i64, params_json, timestamp.to_rfc3339(), is_write as i64],
        )
        .map_err(|e| SwarmError::LedgerWriteFailed(e.to_string()))?;
        let id = conn.last_insert_rowid();

        Ok(ToolCall { id, agent_id: agent_id.to_string(), tool_name: tool_name.to_string(), address, parameters, timestamp, is_write_operation: is_write })
    }

    /// Every prior row at `(address, tool_name)` from another agent where
    /// either side is a write, excluding rows whose parameters are
    /// byte-equal to the incoming call's (§4.2: "tool-specific equivalence
    /// is allowed"). A conflict is declared when this returns non-empty.
    pub fn check_for_conflicts(&self, agent_id: &str, address: u64, tool_name: &str, parameters: &serde_json::Value) -> Result<Vec<ToolConflict>, SwarmError> {
        let incoming = self.record_probe(agent_id, tool_name, address, parameters.clone());
        let prior = self.get_address_tool_calls(address)?;

        let conflicts = prior
            .into_iter()
            .filter(|c| c.agent_id != agent_id && c.tool_name == tool_name)
            .filter(|c| c.is_write_operation || incoming.is_write_operation)
            .filter(|c| &c.parameters != parameters)
            .map(|first_call| ToolConflict { first_call, second_call: incoming.clone() })
            .collect();
        Ok(conflicts)
    }

    /// Build a `ToolCall` the way `record` would, without persisting it.
    /// Used to compare an about-to-be-executed call against history.
    fn record_probe(&self, agent_id: &str, tool_name: &str, address: u64, parameters: serde_json::Value) -> ToolCall {
        ToolCall {
            id: -1,
            agent_id: agent_id.to_string(),
            tool_name: tool_name.to_string(),
            address,
            parameters,
            timestamp: Utc::now(),
            is_write_operation: is_write_tool(tool_name),
        }
    }

    pub fn get_agent_tool_calls(&self, agent_id: &str) -> Result<Vec<ToolCall>, SwarmError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        query_calls(&conn, "WHERE agent_id = ?1 ORDER BY id ASC", params![agent_id])
    }

    pub fn get_address_tool_calls(&self, address: u64) -> Result<Vec<ToolCall>, SwarmError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        query_calls(&conn, "WHERE address = ?1 ORDER BY id ASC", params![address as i64])
    }

    pub fn get_agent_write_operations(&self, agent_id: &str) -> Result<Vec<ToolCall>, SwarmError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        query_calls(&conn, "WHERE agent_id = ?1 AND is_write = 1 ORDER BY id ASC", params![agent_id])
    }

    /// Calls recorded with id strictly greater than `since_id`, in id
    /// order. Used by replay during merge (C5) and by the polling monitor
    /// below.
    pub fn calls_since(&self, since_id: i64) -> Result<Vec<ToolCall>, SwarmError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        query_calls(&conn, "WHERE id > ?1 ORDER BY id ASC", params![since_id])
    }

    pub fn agent_stats(&self, agent_id: &str) -> Result<AgentToolStats, SwarmError> {
        let calls = self.get_agent_tool_calls(agent_id)?;
        let mut stats = AgentToolStats::default();
        stats.total_calls = calls.len() as u64;
        for call in &calls {
            if call.is_write_operation {
                stats.write_calls += 1;
            } else {
                stats.read_calls += 1;
            }
        }
        for call in &calls {
            if call.is_write_operation {
                let conflicts = self.check_for_conflicts(&call.agent_id, call.address, &call.tool_name, &call.parameters)?;
                stats.conflicts += conflicts.len() as u64;
            }
        }
        Ok(stats)
    }

    /// Drop every row recorded by `agent_id`. Used once its database fork
    /// has been merged or discarded (C5).
    pub fn clear_agent_data(&self, agent_id: &str) -> Result<(), SwarmError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute("DELETE FROM tool_calls WHERE agent_id = ?1", params![agent_id])
            .map_err(|e| SwarmError::LedgerWriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Highest assigned ledger id, or `0` if the ledger is empty. Callers
    /// polling for new rows (C9's `#results` watcher, the monitor loop)
    /// seed their `last_seen_id` from this.
    pub fn last_id(&self) -> Result<i64, SwarmError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.query_row("SELECT COALESCE(MAX(id), 0) FROM tool_calls", [], |row| row.get(0))
            .optional()
            .map_err(|e| SwarmError::LedgerWriteFailed(e.to_string()))
            .map(|v: Option<i64>| v.unwrap_or(0))
    }
}

fn query_calls(conn: &Connection, where_clause: &str, bound: &[&dyn rusqlite::ToSql]) -> Result<Vec<ToolCall>, SwarmError> {
    let sql = format!(
        "SELECT id, agent_id, tool_name, address, parameters_json, timestamp, is_write FROM tool_calls {where_clause}"
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| SwarmError::LedgerWriteFailed(e.to_string()))?;
    let rows = stmt
        .query_map(bound, |row| {
            let address: i64 = row.get(3)?;
            let params_json: String = row.get(4)?;
            let timestamp: String = row.get(5)?;
            let is_write: i64 = row.get(6)?;
            Ok(ToolCall {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                tool_name: row.get(2)?,
                address: address as u64,
                parameters: serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null),
                timestamp: timestamp.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
                is_write_operation: is_write != 0,
            })
        })
        .map_err(|e| SwarmError::LedgerWriteFailed(e.to_string()))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| SwarmError::LedgerWriteFailed(e.to_string()))?);
    }
    debug!(count = out.len(), "ledger query returned rows");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_fetch_round_trips() {
        let ledger = Ledger::open_in_memory().unwrap();
        let call = ledger.record("agent_1", "set_name", 0x1000, serde_json::json!({"name": "foo"})).unwrap();
        assert!(call.id > 0);
        assert!(call.is_write_operation);

        let calls = ledger.get_agent_tool_calls("agent_1").unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "set_name");
    }

    #[test]
    fn conflicting_writes_from_different_agents_are_detected() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record("agent_1", "set_comment", 0x2000, serde_json::json!({"text": "a"})).unwrap();

        let conflicts = ledger.check_for_conflicts("agent_2", 0x2000, "set_comment", &serde_json::json!({"text": "b"})).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].first_call.agent_id, "agent_1");
    }

    #[test]
    fn byte_equal_parameters_do_not_conflict() {
        let ledger = Ledger::open_in_memory().unwrap();
        let params = serde_json::json!({"text": "a"});
        ledger.record("agent_1", "set_comment", 0x2000, params.clone()).unwrap();

        let conflicts = ledger.check_for_conflicts("agent_2", 0x2000, "set_comment", &params).unwrap();
        assert!(conflicts.is_empty());
    }

    #[test]
    fn same_agent_repeat_write_is_not_a_conflict() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record("agent_1", "set_comment", 0x2000, serde_json::json!({"text": "a"})).unwrap();

        let conflicts = ledger.check_for_conflicts("agent_1", 0x2000, "set_comment", &serde_json::json!({"text": "b"})).unwrap();
        assert!(conflicts.is_empty());
    }

    #[test]
    fn read_only_tool_never_conflicts() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record("agent_1", "get_disasm", 0x3000, serde_json::json!({"range": "a"})).unwrap();

        let conflicts = ledger.check_for_conflicts("agent_2", 0x3000, "get_disasm", &serde_json::json!({"range": "b"})).unwrap();
        assert!(conflicts.is_empty());
    }

    #[test]
    fn calls_since_is_ordered_and_exclusive() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record("agent_1", "set_name", 0x1, serde_json::json!({})).unwrap();
        let second = ledger.record("agent_1", "set_name", 0x2, serde_json::json!({})).unwrap();
        ledger.record("agent_1", "set_name", 0x3, serde_json::json!({})).unwrap();

        let since = ledger.calls_since(second.id).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].address, 0x3);
    }

    #[test]
    fn agent_stats_counts_writes_reads_and_conflicts() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record("agent_1", "set_name", 0x10, serde_json::json!({})).unwrap();
        ledger.record("agent_2", "set_name", 0x10, serde_json::json!({})).unwrap();
        ledger.record("agent_1", "get_disasm", 0x20, serde_json::json!({})).unwrap();

        let stats = ledger.agent_stats("agent_1").unwrap();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.write_calls, 1);
        assert_eq!(stats.read_calls, 1);
    }
}
