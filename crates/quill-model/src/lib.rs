// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider-neutral model layer: the data model, the `Generator` contract,
//! six provider adapters, and the streaming→response assembler.

pub mod registry;

mod anthropic;
mod auth;
mod aws;
mod cohere;
mod error;
mod generator;
mod google;
mod mock;
mod openai_chat;
mod responses;
mod stream;
mod types;

pub use anthropic::AnthropicAdapter;
pub use auth::Credential;
pub use aws::BedrockAdapter;
pub use cohere::CohereAdapter;
pub use error::{GenError, Result};
pub use generator::{
    ChunkStream, Generator, StreamChunk, StreamingGenerator, TokenSource, ToolCallback,
};
pub use google::GoogleAdapter;
pub use mock::{EchoAdapter, ScriptedAdapter};
pub use openai_chat::OpenAiChatAdapter;
pub use registry::{get_driver, known_driver_ids, DriverMeta};
pub use responses::{ResponsesAdapter, REASONING_SUMMARY_ARG};
pub use stream::StreamedGenerator;
pub use types::*;

use std::sync::Arc;
use std::time::Duration;

use quill_config::{AuthMethod, ModelConfig};

/// Extra construction inputs that cannot live in serialized config: the
/// OAuth token source, a system prompt, and an optional pre-built HTTP
/// client (body-patching and OAuth transports compose out there).
#[derive(Default)]
pub struct AdapterDeps {
    pub system_prompt: Option<String>,
    pub token_source: Option<Arc<dyn TokenSource>>,
    pub http_client: Option<reqwest::Client>,
}

/// Construct a [`Generator`] from configuration.
///
/// Streaming-capable adapters are wrapped in the stream assembler here — the
/// streaming path is always preferred when a vendor offers both, so batch
/// callers never hit idle timeouts on long generations.  The Responses
/// adapter additionally gets `responses_id` metadata propagation so its
/// streamed blocks match what the batch endpoint would have stamped on them.
pub fn from_config(cfg: &ModelConfig, deps: AdapterDeps) -> Result<Arc<dyn Generator>> {
    let timeout = Duration::from_secs(cfg.request_timeout_secs);
    let credential = resolve_credential(cfg, deps.token_source)?;
    let base_url = cfg.base_url.clone();
    let system = deps.system_prompt;
    let client = deps.http_client;

    match cfg.provider.as_str() {
        "anthropic" => {
            let adapter = AnthropicAdapter::new(
                cfg.model.clone(),
                credential,
                base_url,
                cfg.max_tokens,
                system,
                timeout,
                client,
            )?;
            Ok(Arc::new(StreamedGenerator::new(Arc::new(adapter))))
        }
        "google" => {
            let adapter = GoogleAdapter::new(
                cfg.model.clone(),
                credential,
                base_url,
                cfg.max_tokens,
                system,
                timeout,
                client,
            )?;
            Ok(Arc::new(StreamedGenerator::new(Arc::new(adapter))))
        }
        "openai_chat" => {
            let adapter = OpenAiChatAdapter::new(
                "openai_chat",
                cfg.model.clone(),
                credential,
                base_url,
                cfg.max_tokens,
                system,
                timeout,
                client,
            )?;
            Ok(Arc::new(StreamedGenerator::new(Arc::new(adapter))))
        }
        "responses" => {
            let adapter = ResponsesAdapter::new(
                cfg.model.clone(),
                credential,
                base_url,
                cfg.max_tokens,
                system,
                timeout,
                client,
            )?;
            Ok(Arc::new(StreamedGenerator::with_propagated_keys(
                Arc::new(adapter),
                vec![usage::RESPONSES_ID.to_string()],
            )))
        }
        "aws" => {
            let adapter = BedrockAdapter::new(
                cfg.model.clone(),
                cfg.aws_region.clone(),
                cfg.max_tokens,
                system,
                timeout,
                client,
            )?;
            Ok(Arc::new(adapter))
        }
        "cohere" => {
            let adapter = CohereAdapter::new(
                cfg.model.clone(),
                credential,
                base_url,
                cfg.max_tokens,
                system,
                timeout,
                client,
            )?;
            Ok(Arc::new(adapter))
        }
        // Offline smoke testing.
        "mock" => Ok(Arc::new(EchoAdapter)),
        other => {
            let known: Vec<&str> = registry::known_driver_ids().collect();
            Err(GenError::Config(format!(
                "unknown model provider: {other:?} (known providers: {})",
                known.join(", ")
            )))
        }
    }
}

/// Resolve the credential for `cfg`.  API-key presence is asserted here so
/// misconfiguration fails at construction, never mid-turn.
fn resolve_credential(
    cfg: &ModelConfig,
    token_source: Option<Arc<dyn TokenSource>>,
) -> Result<Credential> {
    match cfg.auth {
        AuthMethod::ApiKey => {
            // AWS SigV4 reads its own env vars; no API key to assert.
            if cfg.provider == "aws" || cfg.provider == "mock" {
                return Ok(Credential::None);
            }
            let env_name = cfg
                .api_key_env
                .clone()
                .or_else(|| {
                    registry::get_driver(&cfg.provider)
                        .and_then(|d| d.default_api_key_env)
                        .map(String::from)
                })
                .ok_or_else(|| {
                    GenError::Config(format!("no api key env var known for {:?}", cfg.provider))
                })?;
            Credential::from_env(&env_name)
        }
        AuthMethod::Oauth => token_source
            .map(Credential::Oauth)
            .ok_or_else(|| GenError::Config("oauth auth selected but no token source injected".into())),
        AuthMethod::None => Ok(Credential::None),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
