// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic driver — native Messages API, streaming.
//!
//! # Auth
//! API key via `x-api-key`, or an injected OAuth token source via
//! `Authorization: Bearer`.  OAuth tokens are only accepted by the API when
//! the request opts into the `oauth-2025-04-20` beta **and** the first system
//! block is the vendor-mandated CLI prefix, so OAuth mode prepends that
//! prefix ahead of any caller-supplied system prompt.
//!
//! # Adapter quirk
//! Extended thinking requires `temperature = 1`.  When a thinking budget is
//! set and the caller asked for a different temperature, the adapter clamps
//! and emits a one-line warning rather than silently overriding.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    auth::Credential,
    error::{GenError, Result},
    generator::{ChunkStream, StreamChunk, StreamingGenerator},
    types::{
        usage, Block, BlockType, Dialog, GenOpts, Modality, Role, UsageMetadata, SIGNATURE_KEY,
    },
};

/// First system block required by the API when authenticating with an OAuth
/// token instead of an API key.
const OAUTH_SYSTEM_PREFIX: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

const PROVIDER_ID: &str = "anthropic";

pub struct AnthropicAdapter {
    model: String,
    credential: Credential,
    base_url: String,
    max_tokens: u32,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(
        model: String,
        credential: Credential,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        system_prompt: Option<String>,
        timeout: Duration,
        client: Option<reqwest::Client>,
    ) -> Result<Self> {
        Ok(Self {
            model,
            credential,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
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
        let mut body = json!({
            "model": self.model,
            "messages": build_messages(dialog)?,
            "max_tokens": self.max_tokens,
            "stream": true,
        });

        let mut system_blocks: Vec<Value> = Vec::new();
        if self.credential.is_oauth() {
            system_blocks.push(json!({ "type": "text", "text": OAUTH_SYSTEM_PREFIX }));
        }
        if let Some(sys) = &self.system_prompt {
            if !sys.is_empty() {
                system_blocks.push(json!({ "type": "text", "text": sys }));
            }
        }
        if !system_blocks.is_empty() {
            body["system"] = json!(system_blocks);
        }

        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(k) = opts.top_k {
            body["top_k"] = json!(k);
        }
        if !opts.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(opts.stop_sequences);
        }
        if !opts.tools.is_empty() {
            let tools: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        if let Some(budget) = opts.thinking_budget.budget_tokens() {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
            // Extended thinking rejects any temperature other than 1.
            match opts.temperature {
                Some(t) if (t - 1.0).abs() > f32::EPSILON => {
                    warn!(
                        requested = t,
                        "anthropic requires temperature=1 with extended thinking; clamping"
                    );
                    body["temperature"] = json!(1.0);
                }
                _ => {
                    body["temperature"] = json!(1.0);
                }
            }
        }

        // Provider quirks pass through verbatim; caller keys win.
        if let Some(obj) = body.as_object_mut() {
            for (k, v) in &opts.extra_args {
                obj.insert(k.clone(), v.clone());
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl StreamingGenerator for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    async fn stream(
        &self,
        ctx: &CancellationToken,
        dialog: &Dialog,
        opts: &GenOpts,
    ) -> Result<ChunkStream> {
        let body = self.build_body(dialog, opts)?;
        let token = self.credential.resolve().await?;

        let mut request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", "2023-06-01");
        if self.credential.is_oauth() {
            request = request
                .bearer_auth(&token)
                .header("anthropic-beta", "oauth-2025-04-20");
        } else {
            request = request.header("x-api-key", &token);
        }

        debug!(model = %self.model, oauth = self.credential.is_oauth(), "sending anthropic request");

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

        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward; only complete lines are parsed.
        let byte_stream = resp.bytes_stream();
        let chunk_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
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
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            out.extend(parse_event(&v).map(Ok));
                        }
                    }
                }
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(chunk_stream))
    }
}

/// Map one SSE event to a stream chunk.  Events that carry nothing useful
/// (ping, message_stop, signature bookkeeping noise) return `None`.
pub(crate) fn parse_event(v: &Value) -> Option<StreamChunk> {
    let index = v["index"].as_u64().unwrap_or(0) as u32;
    match v["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            let block = &v["content_block"];
            match block["type"].as_str().unwrap_or("") {
                "tool_use" => {
                    let mut b = Block::tool_call(
                        block["id"].as_str().unwrap_or(""),
                        block["name"].as_str().unwrap_or(""),
                        json!({}),
                    );
                    // Arguments arrive via input_json_delta; start empty.
                    b.content.clear();
                    Some(StreamChunk::block(0, index, b))
                }
                "thinking" => Some(StreamChunk::block(0, index, Block::thinking("", PROVIDER_ID))),
                "text" => Some(StreamChunk::block(0, index, Block::text(""))),
                _ => None,
            }
        }
        "content_block_delta" => {
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("");
                    Some(StreamChunk::block(0, index, Block::text(text)))
                }
                "thinking_delta" => {
                    let text = delta["thinking"].as_str().unwrap_or("");
                    Some(StreamChunk::block(0, index, Block::thinking(text, PROVIDER_ID)))
                }
                "input_json_delta" => {
                    let b = Block {
                        block_type: BlockType::ToolCall,
                        modality: Modality::Text,
                        mime_type: String::new(),
                        content: delta["partial_json"].as_str().unwrap_or("").to_string(),
                        id: None,
                        extra_fields: Map::new(),
                    };
                    Some(StreamChunk::block(0, index, b))
                }
                // The signature is an opaque integrity blob; keep it on the
                // thinking block so resumption can echo it back.
                "signature_delta" => {
                    let sig = delta["signature"].as_str().unwrap_or("");
                    if sig.is_empty() {
                        return None;
                    }
                    let mut b = Block::thinking("", PROVIDER_ID);
                    b.extra_fields.insert(SIGNATURE_KEY.into(), Value::String(sig.into()));
                    Some(StreamChunk::block(0, index, b))
                }
                _ => None,
            }
        }
        "message_start" => {
            let u = &v["message"]["usage"];
            if u.is_object() {
                let mut meta = UsageMetadata::new();
                usage::set_u64(&mut meta, usage::INPUT_TOKENS, u["input_tokens"].as_u64().unwrap_or(0));
                usage::set_u64(
                    &mut meta,
                    usage::CACHE_READ_TOKENS,
                    u["cache_read_input_tokens"].as_u64().unwrap_or(0),
                );
                usage::set_u64(
                    &mut meta,
                    usage::CACHE_WRITE_TOKENS,
                    u["cache_creation_input_tokens"].as_u64().unwrap_or(0),
                );
                Some(StreamChunk::usage(meta))
            } else {
                None
            }
        }
        "message_delta" => {
            let u = &v["usage"];
            if u.is_object() {
                let mut meta = UsageMetadata::new();
                usage::set_u64(
                    &mut meta,
                    usage::GENERATION_TOKENS,
                    u["output_tokens"].as_u64().unwrap_or(0),
                );
                Some(StreamChunk::usage(meta))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Convert the neutral dialog into Anthropic's wire format.
fn build_messages(dialog: &Dialog) -> Result<Vec<Value>> {
    let mut out: Vec<Value> = Vec::new();
    for m in dialog {
        let role = match m.role {
            Role::User | Role::ToolResult => "user",
            Role::Assistant => "assistant",
        };
        let mut content: Vec<Value> = Vec::new();
        for b in &m.blocks {
            match b.block_type {
                BlockType::Content => content.push(content_block(b)?),
                BlockType::Thinking => {
                    let mut block = json!({ "type": "thinking", "thinking": b.content });
                    if let Some(sig) = b.extra_fields.get(SIGNATURE_KEY) {
                        block["signature"] = sig.clone();
                    }
                    content.push(block);
                }
                BlockType::ToolCall => {
                    let (name, input) = b
                        .tool_call_parts()
                        .ok_or_else(|| GenError::malformed("tool call block without a name"))?;
                    content.push(json!({
                        "type": "tool_use",
                        "id": b.id.clone().unwrap_or_default(),
                        "name": name,
                        "input": input,
                    }));
                }
                BlockType::ToolResult => {
                    content.push(json!({
                        "type": "tool_result",
                        "tool_use_id": b.id.clone().unwrap_or_default(),
                        "content": b.content,
                        "is_error": m.tool_result_error,
                    }));
                }
            }
        }
        out.push(json!({ "role": role, "content": content }));
    }
    Ok(out)
}

fn content_block(b: &Block) -> Result<Value> {
    match b.modality {
        Modality::Text => Ok(json!({ "type": "text", "text": b.content })),
        Modality::Image => Ok(json!({
            "type": "image",
            "source": { "type": "base64", "media_type": b.mime_type, "data": b.content },
        })),
        Modality::Pdf => Ok(json!({
            "type": "document",
            "source": { "type": "base64", "media_type": b.mime_type, "data": b.content },
        })),
        other => Err(GenError::UnsupportedModality(other)),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, ThinkingBudget, TOOL_NAME_KEY};

    fn adapter(credential: Credential) -> AnthropicAdapter {
        AnthropicAdapter::new(
            "claude-sonnet-4-5".into(),
            credential,
            None,
            None,
            Some("be terse".into()),
            Duration::from_secs(600),
            None,
        )
        .unwrap()
    }

    // ── Payload building ─────────────────────────────────────────────────────

    #[test]
    fn plain_dialog_maps_roles_and_text() {
        let a = adapter(Credential::ApiKey("k".into()));
        let body = a.build_body(&vec![Message::user("hello")], &GenOpts::default()).unwrap();
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], "hello");
        assert_eq!(body["system"][0]["text"], "be terse");
        assert_eq!(body["stream"], json!(true));
    }

    #[test]
    fn oauth_prepends_vendor_system_prefix() {
        struct Tok;
        #[async_trait]
        impl crate::generator::TokenSource for Tok {
            async fn token(&self) -> Result<String> {
                Ok("t".into())
            }
        }
        let a = adapter(Credential::Oauth(std::sync::Arc::new(Tok)));
        let body = a.build_body(&vec![Message::user("x")], &GenOpts::default()).unwrap();
        assert_eq!(body["system"][0]["text"], OAUTH_SYSTEM_PREFIX);
        assert_eq!(body["system"][1]["text"], "be terse");
    }

    #[test]
    fn tool_call_and_result_round_trip_wire_shape() {
        let a = adapter(Credential::ApiKey("k".into()));
        let dialog = vec![
            Message::user("ls please"),
            Message {
                role: Role::Assistant,
                blocks: vec![Block::tool_call("tc_1", "list_dir", json!({ "path": "." }))],
                tool_result_error: false,
                extra_fields: Map::new(),
            },
            Message::tool_result("tc_1", "a.rs\nb.rs"),
        ];
        let body = a.build_body(&dialog, &GenOpts::default()).unwrap();
        let tc = &body["messages"][1]["content"][0];
        assert_eq!(tc["type"], "tool_use");
        assert_eq!(tc["name"], "list_dir");
        assert_eq!(tc["input"]["path"], ".");
        let tr = &body["messages"][2]["content"][0];
        assert_eq!(tr["type"], "tool_result");
        assert_eq!(tr["tool_use_id"], "tc_1");
        assert_eq!(tr["is_error"], json!(false));
        assert_eq!(body["messages"][2]["role"], "user");
    }

    #[test]
    fn thinking_budget_sets_thinking_and_clamps_temperature() {
        let a = adapter(Credential::ApiKey("k".into()));
        let opts = GenOpts {
            thinking_budget: ThinkingBudget::Medium,
            temperature: Some(0.2),
            ..GenOpts::default()
        };
        let body = a.build_body(&vec![Message::user("x")], &opts).unwrap();
        assert_eq!(body["thinking"]["budget_tokens"], json!(8192));
        assert_eq!(body["temperature"], json!(1.0));
    }

    #[test]
    fn thinking_block_resent_with_signature() {
        let a = adapter(Credential::ApiKey("k".into()));
        let mut think = Block::thinking("prior reasoning", "anthropic");
        think.extra_fields.insert(SIGNATURE_KEY.into(), json!("sig_abc"));
        let dialog = vec![Message {
            role: Role::Assistant,
            blocks: vec![think, Block::text("answer")],
            tool_result_error: false,
            extra_fields: Map::new(),
        }];
        let body = a.build_body(&dialog, &GenOpts::default()).unwrap();
        let tb = &body["messages"][0]["content"][0];
        assert_eq!(tb["type"], "thinking");
        assert_eq!(tb["signature"], "sig_abc");
    }

    #[test]
    fn video_input_is_unsupported() {
        let a = adapter(Credential::ApiKey("k".into()));
        let dialog = vec![Message {
            role: Role::User,
            blocks: vec![Block::binary(Modality::Video, "video/mp4", "AAAA")],
            tool_result_error: false,
            extra_fields: Map::new(),
        }];
        let err = a.build_body(&dialog, &GenOpts::default()).unwrap_err();
        assert!(matches!(err, GenError::UnsupportedModality(Modality::Video)));
    }

    #[test]
    fn extra_args_pass_through() {
        let a = adapter(Credential::ApiKey("k".into()));
        let mut opts = GenOpts::default();
        opts.extra_args.insert("metadata".into(), json!({ "user_id": "u1" }));
        let body = a.build_body(&vec![Message::user("x")], &opts).unwrap();
        assert_eq!(body["metadata"]["user_id"], "u1");
    }

    // ── Event parsing ─────────────────────────────────────────────────────────

    #[test]
    fn text_delta_becomes_content_chunk() {
        let c = parse_event(&json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": { "type": "text_delta", "text": "hi" }
        }))
        .unwrap();
        assert_eq!(c.block_index, 1);
        assert_eq!(c.block.unwrap().content, "hi");
    }

    #[test]
    fn thinking_delta_is_tagged_with_provider() {
        let c = parse_event(&json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "thinking_delta", "thinking": "step 1" }
        }))
        .unwrap();
        let b = c.block.unwrap();
        assert_eq!(b.block_type, BlockType::Thinking);
        assert_eq!(b.thinking_generator(), Some("anthropic"));
    }

    #[test]
    fn tool_use_start_carries_id_and_name() {
        let c = parse_event(&json!({
            "type": "content_block_start",
            "index": 2,
            "content_block": { "type": "tool_use", "id": "toolu_1", "name": "grep" }
        }))
        .unwrap();
        let b = c.block.unwrap();
        assert_eq!(b.id.as_deref(), Some("toolu_1"));
        assert_eq!(b.extra_fields[TOOL_NAME_KEY], json!("grep"));
        assert!(b.content.is_empty());
    }

    #[test]
    fn input_json_delta_appends_raw_arguments() {
        let c = parse_event(&json!({
            "type": "content_block_delta",
            "index": 2,
            "delta": { "type": "input_json_delta", "partial_json": "{\"q\":" }
        }))
        .unwrap();
        assert_eq!(c.block.unwrap().content, "{\"q\":");
    }

    #[test]
    fn signature_delta_enriches_thinking_block() {
        let c = parse_event(&json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "signature_delta", "signature": "EqRk" }
        }))
        .unwrap();
        let b = c.block.unwrap();
        assert_eq!(b.extra_fields[SIGNATURE_KEY], json!("EqRk"));
        assert!(b.content.is_empty());
    }

    #[test]
    fn message_start_reports_input_and_cache_usage() {
        let c = parse_event(&json!({
            "type": "message_start",
            "message": { "usage": {
                "input_tokens": 100, "cache_read_input_tokens": 80,
                "cache_creation_input_tokens": 20
            }}
        }))
        .unwrap();
        let u = c.usage.unwrap();
        assert_eq!(usage::get_u64(&u, usage::INPUT_TOKENS), 100);
        assert_eq!(usage::get_u64(&u, usage::CACHE_READ_TOKENS), 80);
        assert_eq!(usage::get_u64(&u, usage::CACHE_WRITE_TOKENS), 20);
    }

    #[test]
    fn message_delta_reports_generation_usage() {
        let c = parse_event(&json!({
            "type": "message_delta",
            "usage": { "output_tokens": 42 }
        }))
        .unwrap();
        assert_eq!(usage::get_u64(&c.usage.unwrap(), usage::GENERATION_TOKENS), 42);
    }

    #[test]
    fn ping_and_message_stop_yield_nothing() {
        assert!(parse_event(&json!({ "type": "ping" })).is_none());
        assert!(parse_event(&json!({ "type": "message_stop" })).is_none());
    }
}
