// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use crate::SwarmError;

/// One message in the conversation sent to the model.
#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: String,
    pub text: String,
}

impl LlmMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: "user".into(), text: text.into() }
    }
}

/// A tool schema offered to the model, forcing it to respond with a tool
/// call rather than free text (used by C8, the Consensus Executor).
#[derive(Debug, Clone)]
pub struct LlmToolSchema {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// A single turn request to the LLM driver collaborator.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub messages: Vec<LlmMessage>,
    pub tools: Vec<LlmToolSchema>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A captured tool call from the model's response.
#[derive(Debug, Clone)]
pub struct LlmToolCall {
    pub tool_name: String,
    pub parameters: Value,
}

/// The model's reply: either a tool call (what C8 wants) or plain text
/// (what the orchestrator control loop treats as task completion, §4.9).
#[derive(Debug, Clone)]
pub enum LlmResponse {
    ToolCall(LlmToolCall),
    Text(String),
}

/// Port for the out-of-scope LLM HTTP client / conversation loop (§1).
///
/// Implementations own retries for transport-level failures internally but
/// surface `SwarmError::LlmRecoverable` / `SwarmError::LlmFatal` so callers
/// (the orchestrator control loop, C9) can apply the backoff policy in §7.
#[async_trait]
pub trait LlmDriver: Send + Sync {
    async fn send(&self, request: LlmRequest) -> Result<LlmResponse, SwarmError>;
}
