// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cohere driver — Chat API v2, batch.
//!
//! Command models take no reasoning parameter, so thinking budgets are
//! ignored here (logged at debug).  Text and tool calls only; images ride as
//! `image_url` content parts.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    auth::Credential,
    error::{GenError, Result},
    generator::Generator,
    types::{
        usage, Block, BlockType, Dialog, GenOpts, Message, Modality, Response, Role, UsageMetadata,
    },
};

pub struct CohereAdapter {
    model: String,
    credential: Credential,
    base_url: String,
    max_tokens: u32,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl CohereAdapter {
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
            base_url: base_url.unwrap_or_else(|| "https://api.cohere.com".into()),
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
                            BlockType::Thinking => {
                                debug!("dropping thinking block from cohere history")
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
            "max_tokens": self.max_tokens,
        });
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            body["p"] = json!(p);
        }
        if let Some(k) = opts.top_k {
            body["k"] = json!(k);
        }
        if !opts.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(opts.stop_sequences);
        }
        if !opts.thinking_budget.is_off() {
            debug!("cohere chat v2 has no reasoning parameter; thinking budget ignored");
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
impl Generator for CohereAdapter {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        opts: &GenOpts,
    ) -> Result<Response> {
        let body = self.build_body(dialog, opts)?;
        let key = self.credential.resolve().await?;
        let url = format!("{}/v2/chat", self.base_url.trim_end_matches('/'));

        debug!(model = %self.model, "sending cohere chat request");

        let resp = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GenError::Cancelled),
            resp = self.client.post(&url).bearer_auth(&key).json(&body).send() => {
                resp.map_err(GenError::transport)?
            }
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(GenError::from_status(status, text));
        }

        let payload: Value = resp.json().await.map_err(GenError::transport)?;
        parse_chat_response(&payload)
    }
}

pub(crate) fn parse_chat_response(payload: &Value) -> Result<Response> {
    let message = payload
        .get("message")
        .ok_or_else(|| GenError::malformed("cohere response missing message"))?;

    let mut blocks: Vec<Block> = Vec::new();
    if let Some(content) = message["content"].as_array() {
        for part in content {
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    blocks.push(Block::text(text));
                }
            }
        }
    }
    if let Some(tcs) = message["tool_calls"].as_array() {
        for tc in tcs {
            let args: Value = tc["function"]["arguments"]
                .as_str()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(json!({}));
            blocks.push(Block::tool_call(
                tc["id"].as_str().unwrap_or(""),
                tc["function"]["name"].as_str().unwrap_or(""),
                args,
            ));
        }
    }

    let mut meta = UsageMetadata::new();
    let tokens = &payload["usage"]["tokens"];
    usage::set_u64(&mut meta, usage::INPUT_TOKENS, tokens["input_tokens"].as_u64().unwrap_or(0));
    usage::set_u64(
        &mut meta,
        usage::GENERATION_TOKENS,
        tokens["output_tokens"].as_u64().unwrap_or(0),
    );
    usage::set_u64(&mut meta, usage::CACHE_READ_TOKENS, 0);
    usage::set_u64(&mut meta, usage::CACHE_WRITE_TOKENS, 0);

    Ok(Response {
        candidates: vec![Message {
            role: Role::Assistant,
            blocks,
            tool_result_error: false,
            extra_fields: Default::default(),
        }],
        usage: meta,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;

    fn adapter() -> CohereAdapter {
        CohereAdapter::new(
            "command-a-03-2025".into(),
            Credential::ApiKey("k".into()),
            None,
            None,
            None,
            Duration::from_secs(600),
            None,
        )
        .unwrap()
    }

    #[test]
    fn tool_result_maps_to_tool_role() {
        let body = adapter()
            .build_body(&vec![Message::tool_result("tc_1", "done")], &GenOpts::default())
            .unwrap();
        assert_eq!(body["messages"][0]["role"], "tool");
        assert_eq!(body["messages"][0]["tool_call_id"], "tc_1");
    }

    #[test]
    fn top_p_and_top_k_use_cohere_names() {
        let opts = GenOpts { top_p: Some(0.9), top_k: Some(40), ..GenOpts::default() };
        let body = adapter().build_body(&vec![Message::user("x")], &opts).unwrap();
        assert_eq!(body["p"], json!(0.9));
        assert_eq!(body["k"], json!(40));
    }

    #[test]
    fn audio_is_unsupported() {
        let dialog = vec![Message {
            role: Role::User,
            blocks: vec![Block::binary(Modality::Audio, "audio/wav", "AAAA")],
            tool_result_error: false,
            extra_fields: Map::new(),
        }];
        let err = adapter().build_body(&dialog, &GenOpts::default()).unwrap_err();
        assert!(matches!(err, GenError::UnsupportedModality(Modality::Audio)));
    }

    #[test]
    fn chat_response_parses_text_and_tool_calls() {
        let resp = parse_chat_response(&json!({
            "message": {
                "content": [{ "type": "text", "text": "hello" }],
                "tool_calls": [{
                    "id": "tc_5",
                    "type": "function",
                    "function": { "name": "ls", "arguments": "{\"path\":\".\"}" }
                }]
            },
            "usage": { "tokens": { "input_tokens": 9, "output_tokens": 4 } }
        }))
        .unwrap();
        let blocks = &resp.candidates[0].blocks;
        assert_eq!(blocks[0].content, "hello");
        let (name, args) = blocks[1].tool_call_parts().unwrap();
        assert_eq!(name, "ls");
        assert_eq!(args["path"], ".");
        assert_eq!(usage::get_u64(&resp.usage, usage::INPUT_TOKENS), 9);
    }

    #[test]
    fn missing_message_is_malformed() {
        assert!(parse_chat_response(&json!({})).is_err());
    }
}
