// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible chat-completions driver, streaming.
//!
//! One adapter covers the whole compatibility family: hosted OpenAI, Groq,
//! Cerebras, and local servers (Ollama, llama.cpp, vLLM) via `base_url`.
//! The `provider_id` given at construction is used for thinking-block origin
//! tags so a Groq-flavoured instance tags its reasoning as `"groq"`.
//!
//! Reasoning deltas arrive under two field names in the wild:
//! `reasoning_content` (llama.cpp, DeepSeek, Qwen) and `reasoning`
//! (OpenRouter-style aggregators).  Both map to Thinking blocks.  Thinking
//! blocks in *outgoing* history are skipped — the chat-completions wire
//! format has no slot to resend them.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    auth::Credential,
    error::{GenError, Result},
    generator::{ChunkStream, StreamChunk, StreamingGenerator},
    types::{
        usage, Block, BlockType, Dialog, GenOpts, Modality, Role, UsageMetadata, TOOL_NAME_KEY,
    },
};

const THINKING_INDEX: u32 = 0;
const TEXT_INDEX: u32 = 1;
const FIRST_TOOL_INDEX: u32 = 2;

pub struct OpenAiChatAdapter {
    provider_id: String,
    model: String,
    credential: Credential,
    base_url: String,
    max_tokens: u32,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl OpenAiChatAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider_id: impl Into<String>,
        model: String,
        credential: Credential,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        system_prompt: Option<String>,
        timeout: Duration,
        client: Option<reqwest::Client>,
    ) -> Result<Self> {
        Ok(Self {
            provider_id: provider_id.into(),
            model,
            credential,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            max_tokens: max_tokens.unwrap_or(8192),
            system_prompt,
            client: match client {
                Some(c) => c,
                None => reqwest::Client::builder()
                    .timeout(timeout)
                    .build()
                    .map_err(|e| GenError::Config(format!("http client: {e}")))?,
            },
        })
    }

    fn build_body(&self, dialog: &Dialog, opts: &GenOpts) -> Result<Value> {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(sys) = &self.system_prompt {
            if !sys.is_empty() {
                messages.push(json!({ "role": "system", "content": sys }));
            }
        }

        for m in dialog {
            match m.role {
                Role::User => {
                    let mut parts: Vec<Value> = Vec::new();
                    for b in &m.blocks {
                        match b.modality {
                            Modality::Text => {
                                parts.push(json!({ "type": "text", "text": b.content }))
                            }
                            Modality::Image => parts.push(json!({
                                "type": "image_url",
                                "image_url": { "url": format!("data:{};base64,{}", b.mime_type, b.content) },
                            })),
                            other => return Err(GenError::UnsupportedModality(other)),
                        }
                    }
                    messages.push(json!({ "role": "user", "content": parts }));
                }
                Role::Assistant => {
                    let mut text = String::new();
                    let mut tool_calls: Vec<Value> = Vec::new();
                    for b in &m.blocks {
                        match b.block_type {
                            BlockType::Content => text.push_str(&b.content),
                            // No wire slot for prior reasoning.
                            BlockType::Thinking => {
                                debug!("dropping thinking block from chat-completions history")
                            }
                            BlockType::ToolCall => {
                                let (name, args) = b.tool_call_parts().ok_or_else(|| {
                                    GenError::malformed("tool call block without a name")
                                })?;
                                tool_calls.push(json!({
                                    "id": b.id.clone().unwrap_or_default(),
                                    "type": "function",
                                    "function": { "name": name, "arguments": args.to_string() },
                                }));
                            }
                            BlockType::ToolResult => {}
                        }
                    }
                    let mut msg = json!({ "role": "assistant" });
                    if !text.is_empty() {
                        msg["content"] = json!(text);
                    }
                    if !tool_calls.is_empty() {
                        msg["tool_calls"] = json!(tool_calls);
                    }
                    messages.push(msg);
                }
                Role::ToolResult => {
                    for b in &m.blocks {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": b.id.clone().unwrap_or_default(),
                            "content": b.content,
                        }));
                    }
                }
            }
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_completion_tokens": self.max_tokens,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = json!(p);
        }
        if !opts.stop_sequences.is_empty() {
            body["stop"] = json!(opts.stop_sequences);
        }
        if let Some(effort) = opts.thinking_budget.effort() {
            body["reasoning_effort"] = json!(effort);
        }
        if !opts.tools.is_empty() {
            let tools: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(obj) = body.as_object_mut() {
            for (k, v) in &opts.extra_args {
                obj.insert(k.clone(), v.clone());
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl StreamingGenerator for OpenAiChatAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn stream(
        &self,
        ctx: &CancellationToken,
        dialog: &Dialog,
        opts: &GenOpts,
    ) -> Result<ChunkStream> {
        let body = self.build_body(dialog, opts)?;
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut request = self.client.post(&url);
        if !matches!(self.credential, Credential::None) {
            request = request.bearer_auth(self.credential.resolve().await?);
        }

        debug!(model = %self.model, provider = %self.provider_id, "sending chat-completions request");

        let resp = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GenError::Cancelled),
            resp = request.json(&body).send() => resp.map_err(GenError::transport)?,
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(GenError::from_status(status, text));
        }

        let provider_id = self.provider_id.clone();
        let byte_stream = resp.bytes_stream();
        let chunk_stream = byte_stream
            .scan(String::new(), move |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(GenError::transport(e))]));
                    }
                };
                buf.push_str(&text);
                let mut out: Vec<Result<StreamChunk>> = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    let data = data.trim();
                    if data == "[DONE]" {
                        continue;
                    }
                    if let Ok(v) = serde_json::from_str::<Value>(data) {
                        out.extend(parse_chunk(&v, &provider_id).into_iter().map(Ok));
                    }
                }
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(chunk_stream))
    }
}

/// Map one streamed completion chunk into stream chunks.
pub(crate) fn parse_chunk(v: &Value, provider_id: &str) -> Vec<StreamChunk> {
    let mut out = Vec::new();

    if let Some(choices) = v["choices"].as_array() {
        for choice in choices {
            let candidate_index = choice["index"].as_u64().unwrap_or(0) as u32;
            let delta = &choice["delta"];

            let thinking = delta
                .get("reasoning_content")
                .and_then(|c| c.as_str())
                .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
            if let Some(t) = thinking {
                if !t.is_empty() {
                    out.push(StreamChunk::block(
                        candidate_index,
                        THINKING_INDEX,
                        Block::thinking(t, provider_id),
                    ));
                }
            }

            if let Some(text) = delta["content"].as_str() {
                if !text.is_empty() {
                    out.push(StreamChunk::block(candidate_index, TEXT_INDEX, Block::text(text)));
                }
            }

            if let Some(tcs) = delta["tool_calls"].as_array() {
                for tc in tcs {
                    // Chunks for parallel calls interleave by this index.
                    let tc_index = tc["index"].as_u64().unwrap_or(0) as u32;
                    let mut b = Block {
                        block_type: BlockType::ToolCall,
                        modality: Modality::Text,
                        mime_type: "application/json".into(),
                        content: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
                        id: tc["id"].as_str().filter(|s| !s.is_empty()).map(String::from),
                        extra_fields: Default::default(),
                    };
                    if let Some(name) = tc["function"]["name"].as_str().filter(|s| !s.is_empty()) {
                        b.extra_fields.insert(TOOL_NAME_KEY.into(), json!(name));
                    }
                    out.push(StreamChunk::block(candidate_index, FIRST_TOOL_INDEX + tc_index, b));
                }
            }
        }
    }

    if let Some(u) = v.get("usage").filter(|u| u.is_object()) {
        let mut meta = UsageMetadata::new();
        usage::set_u64(&mut meta, usage::INPUT_TOKENS, u["prompt_tokens"].as_u64().unwrap_or(0));
        usage::set_u64(
            &mut meta,
            usage::GENERATION_TOKENS,
            u["completion_tokens"].as_u64().unwrap_or(0),
        );
        usage::set_u64(
            &mut meta,
            usage::CACHE_READ_TOKENS,
            u["prompt_tokens_details"]["cached_tokens"].as_u64().unwrap_or(0),
        );
        usage::set_u64(&mut meta, usage::CACHE_WRITE_TOKENS, 0);
        out.push(StreamChunk::usage(meta));
    }

    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
