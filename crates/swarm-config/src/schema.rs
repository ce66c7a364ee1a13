// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub irc: IrcConfig,
    #[serde(default)]
    pub lldb: LldbConfig,
    #[serde(default)]
    pub profiling: ProfilingConfig,
    /// Free-form UI settings. Not read by the core runtime (§6), kept as a
    /// bag of values so a frontend can round-trip whatever it needs through
    /// the same config file.
    #[serde(default)]
    pub ui: serde_json::Value,
}

/// How the orchestrator authenticates against its LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// "api_key" | "oauth" | "env" — which credential path `api_key` below
    /// is interpreted under.
    #[serde(default = "ApiConfig::default_auth_method")]
    pub auth_method: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl ApiConfig {
    fn default_auth_method() -> String {
        "api_key".into()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { auth_method: Self::default_auth_method(), api_key: None, base_url: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub model: OrchestratorModelConfig,
}

/// LLM parameters for the orchestrator's own driving loop (C9) and for the
/// consensus executor (C8), which borrows this same configuration rather
/// than defining a second one (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorModelConfig {
    #[serde(default = "OrchestratorModelConfig::default_model")]
    pub model: String,
    #[serde(default = "OrchestratorModelConfig::default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "OrchestratorModelConfig::default_max_thinking_tokens")]
    pub max_thinking_tokens: u32,
    #[serde(default = "OrchestratorModelConfig::default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub enable_thinking: bool,
}

impl OrchestratorModelConfig {
    fn default_model() -> String {
        "claude-sonnet-4-5".into()
    }
    fn default_max_tokens() -> u32 {
        8192
    }
    fn default_max_thinking_tokens() -> u32 {
        0
    }
    fn default_temperature() -> f32 {
        0.7
    }
}

impl Default for OrchestratorModelConfig {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            max_tokens: Self::default_max_tokens(),
            max_thinking_tokens: Self::default_max_thinking_tokens(),
            temperature: Self::default_temperature(),
            enable_thinking: false,
        }
    }
}

/// Bus (C1) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrcConfig {
    /// Host the bus server binds and agents connect to. The port itself is
    /// chosen per-run by `swarm_bus::allocate_port` (§4.1), not stored here.
    #[serde(default = "IrcConfig::default_server")]
    pub server: String,
}

impl IrcConfig {
    fn default_server() -> String {
        "127.0.0.1".into()
    }
}

impl Default for IrcConfig {
    fn default() -> Self {
        Self { server: Self::default_server() }
    }
}

/// The native-debugger collaborator (§1 out-of-scope, §9 `NativeToolchain`
/// port). Kept in config even though the core runtime never reads these
/// fields itself, because the plugin integration that wires a live
/// debugger in reads this same file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LldbConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub lldb_path: Option<String>,
    #[serde(default)]
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilingConfig {
    #[serde(default)]
    pub enabled: bool,
}
