// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use swarm_bus::{BusClient, BusEvent};
use swarm_core::ports::LlmToolCall;
use swarm_ledger::LedgerHandle;
use tokio::time::Instant;
use tracing::{info, warn};

const ENFORCEMENT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct EnforcementOutcome {
    pub responded: Vec<String>,
    pub timed_out: Vec<String>,
    pub verified: Option<bool>,
}

/// Broadcast `MANUAL_TOOL_EXEC` to every still-alive agent in `agents`,
/// wait up to 5s for each to answer with `MANUAL_TOOL_RESULT`, and fall
/// back to an injected system message for anyone who doesn't (§4.7 step 5,
/// mirroring `enforce_consensus_tool_execution`).
///
/// Drives `bus.recv()` itself while polling, so this is the only reader of
/// `channel` for the duration of the call — callers must not also be
/// draining the same `BusClient` concurrently.
pub async fn enforce_consensus(
    bus: &mut BusClient,
    channel: &str,
    tool_call: &LlmToolCall,
    alive_agents: &[String],
) -> EnforcementOutcome {
    if tool_call.tool_name == "unknown" || alive_agents.is_empty() {
        info!("skipping consensus enforcement: no live agents or unknown tool");
        return EnforcementOutcome::default();
    }

    let mut responded: HashMap<String, bool> = alive_agents.iter().map(|a| (a.clone(), false)).collect();

    let params_str = tool_call.parameters.to_string();
    for agent_id in alive_agents {
        let message = format!("MANUAL_TOOL_EXEC|{agent_id}|{}|{params_str}", tool_call.tool_name);
        let _ = bus.send_message(channel, &message).await;
    }

    let deadline = Instant::now() + ENFORCEMENT_TIMEOUT;
    while !responded.values().all(|ok| *ok) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining.min(POLL_INTERVAL), bus.recv()).await {
            Ok(Some(BusEvent::Privmsg { channel: c, payload, .. })) if c == channel => {
                if let Some(rest) = payload.strip_prefix("MANUAL_TOOL_RESULT|") {
                    let mut parts = rest.splitn(3, '|');
                    if let Some(agent_id) = parts.next() {
                        if responded.contains_key(agent_id) {
                            responded.insert(agent_id.to_string(), true);
                        }
                    }
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {} // poll tick, re-check the deadline
        }
    }

    let (responded, timed_out): (Vec<String>, Vec<String>) = {
        let ok: Vec<String> = responded.iter().filter(|(_, v)| **v).map(|(k, _)| k.clone()).collect();
        let bad: Vec<String> = responded.iter().filter(|(_, v)| !**v).map(|(k, _)| k.clone()).collect();
        (ok, bad)
    };

    for agent_id in &timed_out {
        let fallback = format!(
            "[SYSTEM] FOR AGENT: {agent_id} ONLY! Manual tool execution failed. Please apply the agreed consensus: {} with parameters: {params_str}",
            tool_call.tool_name,
        );
        let _ = bus.send_message(channel, &fallback).await;
        warn!(agent_id, "consensus enforcement timed out, sent fallback instruction");
    }

    EnforcementOutcome { responded, timed_out, verified: None }
}

/// Compare every alive agent's manually-applied parameters at `address`,
/// stripping the `__is_manual`/`__enforced_by` bookkeeping fields first, and
/// report whether they all converged (§4.7 step 6, `verify_consensus_applied`).
/// Returns `false` (not an error) when there's nothing to compare — an
/// empty or singleton result is not proof of agreement.
pub fn verify_consensus_applied(ledger: &LedgerHandle, agents: &[String], address: u64) -> Result<bool, swarm_core::SwarmError> {
    let calls = ledger.get_address_tool_calls(address)?;

    let mut by_agent: HashMap<String, Value> = HashMap::new();
    for call in calls {
        if !agents.contains(&call.agent_id) {
            continue;
        }
        let is_manual = call.parameters.get("__is_manual").and_then(Value::as_bool).unwrap_or(false);
        if !is_manual {
            continue;
        }
        let mut clean = call.parameters.clone();
        if let Some(obj) = clean.as_object_mut() {
            obj.remove("__is_manual");
            obj.remove("__enforced_by");
        }
        by_agent.insert(call.agent_id, clean);
    }

    if by_agent.is_empty() {
        return Ok(false);
    }

    let mut values = by_agent.values();
    let reference = values.next().unwrap();
    Ok(values.all(|v| v == reference))
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_ledger::Ledger;

    #[test]
    fn verify_returns_false_with_no_manual_calls() {
        let ledger = Ledger::open_in_memory().unwrap();
        let agents = vec!["agent_1".to_string()];
        assert!(!verify_consensus_applied(&ledger, &agents, 0x1000).unwrap());
    }

    #[test]
    fn verify_true_when_all_agents_applied_the_same_value() {
        let ledger = Ledger::open_in_memory().unwrap();
        let params = serde_json::json!({"name": "sub_process", "__is_manual": true, "__enforced_by": "orchestrator"});
        ledger.record("agent_1", "set_name", 0x1000, params.clone()).unwrap();
        ledger.record("agent_2", "set_name", 0x1000, params).unwrap();

        let agents = vec!["agent_1".to_string(), "agent_2".to_string()];
        assert!(verify_consensus_applied(&ledger, &agents, 0x1000).unwrap());
    }

    #[test]
    fn verify_false_when_agents_applied_different_values() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record("agent_1", "set_name", 0x1000, serde_json::json!({"name": "a", "__is_manual": true})).unwrap();
        ledger.record("agent_2", "set_name", 0x1000, serde_json::json!({"name": "b", "__is_manual": true})).unwrap();

        let agents = vec!["agent_1".to_string(), "agent_2".to_string()];
        assert!(!verify_consensus_applied(&ledger, &agents, 0x1000).unwrap());
    }
}
