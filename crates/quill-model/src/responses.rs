// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI Responses API driver, streaming.
//!
//! # Adapter quirk — reasoning summaries
//! The Responses API hides reasoning unless the request asks for a summary.
//! A non-empty thinking budget therefore defaults `reasoning.summary` to
//! `"detailed"` — but only when the caller has not chosen a value via
//! `extra_args["reasoning_summary"]`.  This is a quirk of this provider, not
//! a general rule of the pipeline.
//!
//! The response id is reported under the `responses_id` usage key.  The
//! batch endpoint stamps the id on every output item, while the streaming
//! path only reports it once — `from_config` closes the gap by wrapping this
//! adapter in the metadata-propagating assembler for the `responses_id` key.

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
    types::{usage, Block, BlockType, Dialog, GenOpts, Modality, Role, UsageMetadata},
};

const PROVIDER_ID: &str = "responses";

/// `extra_args` key the caller may use to pick a reasoning summary level.
pub const REASONING_SUMMARY_ARG: &str = "reasoning_summary";

pub struct ResponsesAdapter {
    model: String,
    credential: Credential,
    base_url: String,
    max_tokens: u32,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl ResponsesAdapter {
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
        let mut input: Vec<Value> = Vec::new();
        for m in dialog {
            match m.role {
                Role::User => {
                    let mut parts: Vec<Value> = Vec::new();
                    for b in &m.blocks {
                        match b.modality {
                            Modality::Text => {
                                parts.push(json!({ "type": "input_text", "text": b.content }))
                            }
                            Modality::Image => parts.push(json!({
                                "type": "input_image",
                                "image_url": format!("data:{};base64,{}", b.mime_type, b.content),
                            })),
                            Modality::Pdf => parts.push(json!({
                                "type": "input_file",
                                "file_data": format!("data:{};base64,{}", b.mime_type, b.content),
                            })),
                            other => return Err(GenError::UnsupportedModality(other)),
                        }
                    }
                    input.push(json!({ "role": "user", "content": parts }));
                }
                Role::Assistant => {
                    for b in &m.blocks {
                        match b.block_type {
                            BlockType::Content => input.push(json!({
                                "role": "assistant",
                                "content": [{ "type": "output_text", "text": b.content }],
                            })),
                            // Reasoning items cannot be replayed without
                            // their encrypted payload; drop from history.
                            BlockType::Thinking => {
                                debug!("dropping thinking block from responses history")
                            }
                            BlockType::ToolCall => {
                                let (name, args) = b.tool_call_parts().ok_or_else(|| {
                                    GenError::malformed("tool call block without a name")
                                })?;
                                input.push(json!({
                                    "type": "function_call",
                                    "call_id": b.id.clone().unwrap_or_default(),
                                    "name": name,
                                    "arguments": args.to_string(),
                                }));
                            }
                            BlockType::ToolResult => {}
                        }
                    }
                }
                Role::ToolResult => {
                    for b in &m.blocks {
                        input.push(json!({
                            "type": "function_call_output",
                            "call_id": b.id.clone().unwrap_or_default(),
                            "output": b.content,
                        }));
                    }
                }
            }
        }

        let mut body = json!({
            "model": self.model,
            "input": input,
            "max_output_tokens": self.max_tokens,
            "stream": true,
            "store": false,
        });
        if let Some(sys) = &self.system_prompt {
            if !sys.is_empty() {
                body["instructions"] = json!(sys);
            }
        }
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = json!(p);
        }
        if !opts.tools.is_empty() {
            let tools: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(effort) = opts.thinking_budget.effort() {
            let summary = opts
                .extra_args
                .get(REASONING_SUMMARY_ARG)
                .and_then(|v| v.as_str())
                .unwrap_or("detailed");
            body["reasoning"] = json!({ "effort": effort, "summary": summary });
        }
        if let Some(obj) = body.as_object_mut() {
            for (k, v) in &opts.extra_args {
                if k == REASONING_SUMMARY_ARG {
                    continue;
                }
                obj.insert(k.clone(), v.clone());
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl StreamingGenerator for ResponsesAdapter {
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
        let url = format!("{}/responses", self.base_url.trim_end_matches('/'));

        debug!(model = %self.model, "sending responses request");

        let resp = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GenError::Cancelled),
            resp = self.client.post(&url).bearer_auth(&token).json(&body).send() => {
                resp.map_err(GenError::transport)?
            }
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(GenError::from_status(status, text));
        }

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
                            out.extend(parse_event(&v).into_iter().map(Ok));
                        }
                    }
                }
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(chunk_stream))
    }
}

/// Map one Responses SSE event to stream chunks.  The server-assigned
/// `output_index` doubles as the block index, so no client-side counters are
/// needed even with interleaved items.
pub(crate) fn parse_event(v: &Value) -> Vec<StreamChunk> {
    let index = v["output_index"].as_u64().unwrap_or(0) as u32;
    match v["type"].as_str().unwrap_or("") {
        "response.output_item.added" => {
            let item = &v["item"];
            match item["type"].as_str().unwrap_or("") {
                "function_call" => {
                    let mut b = Block::tool_call(
                        item["call_id"].as_str().unwrap_or(""),
                        item["name"].as_str().unwrap_or(""),
                        json!({}),
                    );
                    b.content.clear();
                    vec![StreamChunk::block(0, index, b)]
                }
                "reasoning" => {
                    vec![StreamChunk::block(0, index, Block::thinking("", PROVIDER_ID))]
                }
                _ => vec![],
            }
        }
        "response.output_text.delta" => {
            let delta = v["delta"].as_str().unwrap_or("");
            vec![StreamChunk::block(0, index, Block::text(delta))]
        }
        "response.reasoning_summary_text.delta" => {
            let delta = v["delta"].as_str().unwrap_or("");
            vec![StreamChunk::block(0, index, Block::thinking(delta, PROVIDER_ID))]
        }
        "response.function_call_arguments.delta" => {
            let b = Block {
                block_type: BlockType::ToolCall,
                modality: Modality::Text,
                mime_type: String::new(),
                content: v["delta"].as_str().unwrap_or("").to_string(),
                id: None,
                extra_fields: Default::default(),
            };
            vec![StreamChunk::block(0, index, b)]
        }
        "response.completed" => {
            let resp = &v["response"];
            let mut meta = UsageMetadata::new();
            let u = &resp["usage"];
            usage::set_u64(&mut meta, usage::INPUT_TOKENS, u["input_tokens"].as_u64().unwrap_or(0));
            usage::set_u64(
                &mut meta,
                usage::GENERATION_TOKENS,
                u["output_tokens"].as_u64().unwrap_or(0),
            );
            usage::set_u64(
                &mut meta,
                usage::CACHE_READ_TOKENS,
                u["input_tokens_details"]["cached_tokens"].as_u64().unwrap_or(0),
            );
            usage::set_u64(&mut meta, usage::CACHE_WRITE_TOKENS, 0);
            if let Some(id) = resp["id"].as_str() {
                meta.insert(usage::RESPONSES_ID.into(), json!(id));
            }
            vec![StreamChunk::usage(meta)]
        }
        _ => vec![],
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::types::{Message, ThinkingBudget, TOOL_NAME_KEY};

    fn adapter() -> ResponsesAdapter {
        ResponsesAdapter::new(
            "gpt-5.2".into(),
            Credential::ApiKey("k".into()),
            None,
            None,
            Some("instructions".into()),
            Duration::from_secs(600),
            None,
        )
        .unwrap()
    }

    // ── Payload building ─────────────────────────────────────────────────────

    #[test]
    fn user_text_becomes_input_text_item() {
        let body = adapter().build_body(&vec![Message::user("q")], &GenOpts::default()).unwrap();
        assert_eq!(body["input"][0]["content"][0]["type"], "input_text");
        assert_eq!(body["instructions"], "instructions");
        assert_eq!(body["store"], json!(false));
    }

    #[test]
    fn tool_call_history_becomes_function_call_items() {
        let dialog = vec![
            Message {
                role: Role::Assistant,
                blocks: vec![Block::tool_call("fc_1", "get_weather", json!({ "city": "NYC" }))],
                tool_result_error: false,
                extra_fields: Map::new(),
            },
            Message::tool_result("fc_1", "sunny"),
        ];
        let body = adapter().build_body(&dialog, &GenOpts::default()).unwrap();
        assert_eq!(body["input"][0]["type"], "function_call");
        assert_eq!(body["input"][0]["call_id"], "fc_1");
        assert_eq!(body["input"][1]["type"], "function_call_output");
        assert_eq!(body["input"][1]["output"], "sunny");
    }

    #[test]
    fn thinking_budget_defaults_summary_to_detailed() {
        let opts = GenOpts { thinking_budget: ThinkingBudget::Medium, ..GenOpts::default() };
        let body = adapter().build_body(&vec![Message::user("x")], &opts).unwrap();
        assert_eq!(body["reasoning"]["effort"], "medium");
        assert_eq!(body["reasoning"]["summary"], "detailed");
    }

    #[test]
    fn caller_supplied_summary_is_never_overwritten() {
        let mut opts = GenOpts { thinking_budget: ThinkingBudget::Low, ..GenOpts::default() };
        opts.extra_args.insert(REASONING_SUMMARY_ARG.into(), json!("concise"));
        let body = adapter().build_body(&vec![Message::user("x")], &opts).unwrap();
        assert_eq!(body["reasoning"]["summary"], "concise");
        // The steering arg itself must not leak into the wire body.
        assert!(body.get(REASONING_SUMMARY_ARG).is_none());
    }

    #[test]
    fn no_budget_means_no_reasoning_field() {
        let body = adapter().build_body(&vec![Message::user("x")], &GenOpts::default()).unwrap();
        assert!(body.get("reasoning").is_none());
    }

    #[test]
    fn audio_input_is_unsupported() {
        let dialog = vec![Message {
            role: Role::User,
            blocks: vec![Block::binary(Modality::Audio, "audio/wav", "AAAA")],
            tool_result_error: false,
            extra_fields: Map::new(),
        }];
        let err = adapter().build_body(&dialog, &GenOpts::default()).unwrap_err();
        assert!(matches!(err, GenError::UnsupportedModality(Modality::Audio)));
    }

    // ── Event parsing ─────────────────────────────────────────────────────────

    #[test]
    fn output_text_delta_keys_by_output_index() {
        let chunks = parse_event(&json!({
            "type": "response.output_text.delta",
            "output_index": 3,
            "delta": "hi"
        }));
        assert_eq!(chunks[0].block_index, 3);
        assert_eq!(chunks[0].block.clone().unwrap().content, "hi");
    }

    #[test]
    fn reasoning_summary_delta_is_tagged_thinking() {
        let chunks = parse_event(&json!({
            "type": "response.reasoning_summary_text.delta",
            "output_index": 0,
            "delta": "planning"
        }));
        let b = chunks[0].block.clone().unwrap();
        assert_eq!(b.block_type, BlockType::Thinking);
        assert_eq!(b.thinking_generator(), Some("responses"));
    }

    #[test]
    fn function_call_item_then_arguments_assemble() {
        let added = parse_event(&json!({
            "type": "response.output_item.added",
            "output_index": 1,
            "item": { "type": "function_call", "call_id": "fc_9", "name": "get_weather" }
        }));
        let b = added[0].block.clone().unwrap();
        assert_eq!(b.id.as_deref(), Some("fc_9"));
        assert_eq!(b.extra_fields[TOOL_NAME_KEY], json!("get_weather"));

        let args = parse_event(&json!({
            "type": "response.function_call_arguments.delta",
            "output_index": 1,
            "delta": "{\"city\":\"NYC\"}"
        }));
        assert_eq!(args[0].block_index, 1);
        assert_eq!(args[0].block.clone().unwrap().content, "{\"city\":\"NYC\"}");
    }

    #[test]
    fn completed_event_reports_usage_and_response_id() {
        let chunks = parse_event(&json!({
            "type": "response.completed",
            "response": {
                "id": "resp_abc",
                "usage": {
                    "input_tokens": 50,
                    "output_tokens": 9,
                    "input_tokens_details": { "cached_tokens": 30 }
                }
            }
        }));
        let u = chunks[0].usage.clone().unwrap();
        assert_eq!(usage::get_u64(&u, usage::INPUT_TOKENS), 50);
        assert_eq!(usage::get_u64(&u, usage::CACHE_READ_TOKENS), 30);
        assert_eq!(u[usage::RESPONSES_ID], json!("resp_abc"));
    }

    #[test]
    fn unrelated_events_yield_nothing() {
        assert!(parse_event(&json!({ "type": "response.in_progress" })).is_empty());
    }
}
