// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use serde_json::{json, Value};
use swarm_core::ports::{LlmDriver, LlmMessage, LlmRequest, LlmResponse, LlmToolCall, LlmToolSchema};
use swarm_core::{ConflictSession, SwarmError};

/// Render every participant's consensus statement plus the original
/// conflicting calls into the single prompt sent to the LLM (§4.8 step 1).
pub fn format_consensus_prompt(session: &ConflictSession) -> String {
    let mut out = String::new();
    out.push_str("Two agents wrote conflicting values to the same location. ");
    out.push_str("Read their agreed consensus below and call the single tool that applies it.\n\n");
    out.push_str(&format!(
        "Original conflict: {} called `{}` at {:#x}, {} called the same tool at the same address.\n\n",
        session.original_conflict.first_call.agent_id,
        session.original_conflict.first_call.tool_name,
        session.original_conflict.first_call.address,
        session.original_conflict.second_call.agent_id,
    ));
    out.push_str("Consensus statements:\n");
    for (agent_id, statement) in &session.consensus_statements {
        out.push_str(&format!("- {agent_id}: {statement}\n"));
    }
    out
}

fn consensus_tool_schema() -> LlmToolSchema {
    LlmToolSchema {
        name: "apply_consensus".into(),
        description: "Apply the agreed resolution as a single tool call".into(),
        parameters_schema: json!({
            "type": "object",
            "properties": {
                "tool_name": {"type": "string"},
                "parameters": {"type": "object"},
            },
            "required": ["tool_name", "parameters"],
        }),
    }
}

/// C8: turns a resolved `ConflictSession`'s consensus statements into one
/// concrete tool call, via a single temperature-0 LLM request that is
/// forced to use the `apply_consensus` tool schema (§4.8).
pub struct ConsensusExecutor {
    driver: Arc<dyn LlmDriver>,
}

impl ConsensusExecutor {
    pub fn new(driver: Arc<dyn LlmDriver>) -> Self {
        Self { driver }
    }

    /// Returns the extracted tool call, or the documented fallback —
    /// `{tool_name: original.tool_name, parameters: {address, __needs_manual: true, ...}}`
    /// — when the model's response doesn't contain a usable tool call
    /// (§4.8 step 3, mirroring the original's `extract_consensus_tool_call`
    /// failure path).
    pub async fn execute_consensus(&self, session: &ConflictSession) -> Result<LlmToolCall, SwarmError> {
        let prompt = format_consensus_prompt(session);
        let request = LlmRequest {
            system_prompt: "You resolve reverse-engineering agent conflicts by selecting one concrete tool call.".into(),
            messages: vec![LlmMessage::user(prompt)],
            tools: vec![consensus_tool_schema()],
            temperature: 0.0,
            max_tokens: 1024,
        };

        match self.driver.send(request).await {
            Ok(LlmResponse::ToolCall(call)) if call.tool_name == "apply_consensus" => {
                let tool_name = call
                    .parameters
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .unwrap_or(&session.original_conflict.first_call.tool_name)
                    .to_string();
                let parameters = call.parameters.get("parameters").cloned().unwrap_or_else(|| json!({}));
                Ok(LlmToolCall { tool_name, parameters })
            }
            Ok(_) | Err(_) => Ok(self.fallback(session)),
        }
    }

    fn fallback(&self, session: &ConflictSession) -> LlmToolCall {
        LlmToolCall {
            tool_name: session.original_conflict.first_call.tool_name.clone(),
            parameters: json!({
                "address": session.original_conflict.first_call.address,
                "__needs_manual": true,
                "__fallback_reason": "consensus_executor_failed",
            }),
        }
    }
}
