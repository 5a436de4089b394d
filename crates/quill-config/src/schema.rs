// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be on unless explicitly disabled
/// need a named function.
fn default_true() -> bool {
    true
}

fn default_max_tool_rounds() -> u32 {
    25
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_ms() -> u64 {
    500
}

fn default_retry_max_backoff_secs() -> u64 {
    60
}

fn default_retry_elapsed_cap_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub generation: GenConfig,
    #[serde(default)]
    pub code_mode: CodeModeConfig,
}

/// Which credential the selected provider should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Read an API key from the environment variable named by `api_key_env`
    /// (or the driver's default env var when unset).
    #[default]
    ApiKey,
    /// Use an injected OAuth token source.  The token-refresh machinery lives
    /// outside this workspace; the adapters only consume a `TokenSource`.
    Oauth,
    /// No credential (local inference servers).
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" | "google" | "openai_chat" |
    /// "responses" | "aws" | "cohere".
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub model: String,
    #[serde(default)]
    pub auth: AuthMethod,
    /// Environment variable that holds the API key (read at runtime).
    /// When unset, the driver registry's default env var is used.
    pub api_key_env: Option<String>,
    /// Base URL override.  Useful for local servers, gateways, and proxies;
    /// hosted providers get a correct default from the driver registry.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// AWS region (Bedrock only; also honoured via AWS_REGION env var).
    pub aws_region: Option<String>,
    /// Per-call deadline for one provider HTTP request, independent of the
    /// retry budget.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            model: String::new(),
            auth: AuthMethod::default(),
            api_key_env: None,
            base_url: None,
            max_tokens: None,
            aws_region: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Retry budget for transient provider errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    /// First backoff sleep, in milliseconds.
    #[serde(default = "default_retry_initial_ms")]
    pub initial_backoff_ms: u64,
    /// Ceiling for a single backoff sleep, in seconds.
    #[serde(default = "default_retry_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Total wall-clock budget across all attempts, in seconds.
    #[serde(default = "default_retry_elapsed_cap_secs")]
    pub max_elapsed_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_backoff_ms: default_retry_initial_ms(),
            max_backoff_secs: default_retry_max_backoff_secs(),
            max_elapsed_secs: default_retry_elapsed_cap_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenConfig {
    /// Hard ceiling on model-call/tool-execution rounds in one turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Suppress the response and token-usage printers (headless embedding).
    #[serde(default)]
    pub disable_printing: bool,
    /// Render assistant markdown for the terminal instead of passing it
    /// through verbatim.
    #[serde(default = "default_true")]
    pub render_markdown: bool,
    /// Label forwarded to the dialog store with the first saved message of a
    /// conversation, so stored dialogs can be listed by name.
    pub dialog_label: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for GenConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            disable_printing: false,
            render_markdown: true,
            dialog_label: None,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeModeConfig {
    /// Expose MCP tools as a generated TypeScript runtime instead of
    /// individual tool registrations.
    #[serde(default)]
    pub enabled: bool,
    /// Tool names that bypass code mode and are registered individually.
    #[serde(default)]
    pub excluded_tools: Vec<String>,
    /// Path to the script runtime binary.
    #[serde(default = "default_deno_path")]
    pub runtime_path: String,
    /// Wall-clock limit for one script execution, in seconds.
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
}

fn default_deno_path() -> String {
    "deno".into()
}

fn default_script_timeout_secs() -> u64 {
    300
}

impl Default for CodeModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            excluded_tools: Vec::new(),
            runtime_path: default_deno_path(),
            script_timeout_secs: default_script_timeout_secs(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
