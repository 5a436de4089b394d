// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Driver registry: static metadata for every supported model provider.
//!
//! Single source of truth for which provider ids exist and what their
//! defaults are.  Construction logic lives in [`crate::from_config`].

/// Metadata describing a registered provider adapter.
#[derive(Debug, Clone)]
pub struct DriverMeta {
    /// Unique provider id used in the `model.provider` config field and as
    /// the thinking-block origin tag.
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    pub description: &'static str,
    /// Default environment variable that holds the API key.  `None` for
    /// providers that use non-key auth (AWS SigV4) exclusively.
    pub default_api_key_env: Option<&'static str>,
    /// Default base URL when the user does not set `model.base_url`.
    pub default_base_url: Option<&'static str>,
    /// Whether the adapter streams (and is wrapped in the stream assembler).
    pub streaming: bool,
}

pub static DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "anthropic",
        name: "Anthropic",
        description: "Anthropic Messages API (Claude models); API key or OAuth",
        default_api_key_env: Some("ANTHROPIC_API_KEY"),
        default_base_url: Some("https://api.anthropic.com"),
        streaming: true,
    },
    DriverMeta {
        id: "google",
        name: "Google Gemini",
        description: "Google Generative Language API (Gemini models)",
        default_api_key_env: Some("GEMINI_API_KEY"),
        default_base_url: Some("https://generativelanguage.googleapis.com"),
        streaming: true,
    },
    DriverMeta {
        id: "openai_chat",
        name: "OpenAI Chat Completions",
        description: "OpenAI-compatible chat completions (also Groq, Cerebras, local servers via base_url)",
        default_api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
        streaming: true,
    },
    DriverMeta {
        id: "responses",
        name: "OpenAI Responses",
        description: "OpenAI Responses API with reasoning summaries",
        default_api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
        streaming: true,
    },
    DriverMeta {
        id: "aws",
        name: "AWS Bedrock",
        description: "AWS Bedrock Converse API (uses AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)",
        default_api_key_env: None,
        default_base_url: None,
        streaming: false,
    },
    DriverMeta {
        id: "cohere",
        name: "Cohere",
        description: "Cohere Chat API v2 (Command models)",
        default_api_key_env: Some("COHERE_API_KEY"),
        default_base_url: Some("https://api.cohere.com"),
        streaming: false,
    },
];

pub fn get_driver(id: &str) -> Option<&'static DriverMeta> {
    DRIVERS.iter().find(|d| d.id == id)
}

pub fn known_driver_ids() -> impl Iterator<Item = &'static str> {
    DRIVERS.iter().map(|d| d.id)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
