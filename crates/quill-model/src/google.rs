// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Google Gemini driver — native Generative Language API, streaming.
//!
//! Uses `streamGenerateContent?alt=sse`.  Thought parts (`thought: true`)
//! become Thinking blocks tagged `"google"`; `thoughtSignature` payloads are
//! preserved so resumed conversations can echo them back.
//!
//! Gemini matches tool results to calls by *function name*, not by the
//! opaque call id, so the request builder carries an id→name map scraped
//! from the dialog's ToolCall blocks.

use std::collections::HashMap;
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
        usage, Block, BlockType, Dialog, GenOpts, Modality, Role, UsageMetadata, SIGNATURE_KEY,
    },
};

const PROVIDER_ID: &str = "google";

/// Fixed block indexes for the streamed response: Gemini emits thought
/// summaries first, then answer text, then complete functionCall parts.
const THINKING_INDEX: u32 = 0;
const TEXT_INDEX: u32 = 1;
const FIRST_TOOL_INDEX: u32 = 2;

pub struct GoogleAdapter {
    model: String,
    credential: Credential,
    base_url: String,
    max_tokens: u32,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl GoogleAdapter {
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
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
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
        // id → function name, for functionResponse parts.
        let mut tc_names: HashMap<String, String> = HashMap::new();
        for m in dialog {
            for b in m.tool_calls() {
                if let (Some(id), Some((name, _))) = (b.id.clone(), b.tool_call_parts()) {
                    tc_names.insert(id, name);
                }
            }
        }

        let mut contents: Vec<Value> = Vec::new();
        for m in dialog {
            let role = match m.role {
                Role::User | Role::ToolResult => "user",
                Role::Assistant => "model",
            };
            let mut parts: Vec<Value> = Vec::new();
            for b in &m.blocks {
                match b.block_type {
                    BlockType::Content => parts.push(content_part(b)),
                    BlockType::Thinking => {
                        let mut part = json!({ "text": b.content, "thought": true });
                        if let Some(sig) = b.extra_fields.get(SIGNATURE_KEY) {
                            part["thoughtSignature"] = sig.clone();
                        }
                        parts.push(part);
                    }
                    BlockType::ToolCall => {
                        let (name, args) = b
                            .tool_call_parts()
                            .ok_or_else(|| GenError::malformed("tool call block without a name"))?;
                        parts.push(json!({ "functionCall": { "name": name, "args": args } }));
                    }
                    BlockType::ToolResult => {
                        let id = b.id.clone().unwrap_or_default();
                        let name = tc_names.get(&id).cloned().unwrap_or_else(|| id.clone());
                        let payload = if m.tool_result_error {
                            json!({ "error": b.content })
                        } else {
                            json!({ "output": b.content })
                        };
                        parts.push(json!({
                            "functionResponse": { "name": name, "response": payload }
                        }));
                    }
                }
            }
            contents.push(json!({ "role": role, "parts": parts }));
        }

        let mut generation_config = json!({ "maxOutputTokens": self.max_tokens });
        if let Some(t) = opts.temperature {
            generation_config["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            generation_config["topP"] = json!(p);
        }
        if let Some(k) = opts.top_k {
            generation_config["topK"] = json!(k);
        }
        if !opts.stop_sequences.is_empty() {
            generation_config["stopSequences"] = json!(opts.stop_sequences);
        }
        if let Some(budget) = opts.thinking_budget.budget_tokens() {
            generation_config["thinkingConfig"] = json!({
                "thinkingBudget": budget,
                "includeThoughts": true,
            });
        }

        let mut body = json!({ "contents": contents, "generationConfig": generation_config });
        if let Some(sys) = &self.system_prompt {
            if !sys.is_empty() {
                body["systemInstruction"] = json!({ "parts": [{ "text": sys }] });
            }
        }
        if !opts.tools.is_empty() {
            let decls: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": decls }]);
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
impl StreamingGenerator for GoogleAdapter {
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
        let key = self.credential.resolve().await?;
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            self.model,
        );

        debug!(model = %self.model, "sending google gemini request");

        let resp = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GenError::Cancelled),
            resp = self.client.post(&url).header("x-goog-api-key", &key).json(&body).send() => {
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
            .scan((String::new(), FIRST_TOOL_INDEX), |(buf, next_tool_index), chunk| {
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
                        out.extend(parse_chunk(&v, next_tool_index).into_iter().map(Ok));
                    }
                }
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(chunk_stream))
    }
}

/// Map one streamed `GenerateContentResponse` into stream chunks.
///
/// `next_tool_index` allocates a fresh block index per functionCall part so
/// parallel calls never merge.
pub(crate) fn parse_chunk(v: &Value, next_tool_index: &mut u32) -> Vec<StreamChunk> {
    let mut out = Vec::new();

    if let Some(candidates) = v["candidates"].as_array() {
        for candidate in candidates {
            let candidate_index = candidate["index"].as_u64().unwrap_or(0) as u32;
            let Some(parts) = candidate["content"]["parts"].as_array() else { continue };
            for part in parts {
                if let Some(fc) = part.get("functionCall") {
                    let name = fc["name"].as_str().unwrap_or("");
                    let args = fc.get("args").cloned().unwrap_or(json!({}));
                    // Gemini does not return call ids; synthesize one that is
                    // unique within the response.
                    let id = format!("call_{}_{}", candidate_index, *next_tool_index);
                    let mut b = Block::tool_call(id, name, args);
                    if let Some(sig) = part.get("thoughtSignature") {
                        b.extra_fields.insert(SIGNATURE_KEY.into(), sig.clone());
                    }
                    out.push(StreamChunk::block(candidate_index, *next_tool_index, b));
                    *next_tool_index += 1;
                    continue;
                }
                let Some(text) = part["text"].as_str() else { continue };
                if part["thought"].as_bool().unwrap_or(false) {
                    let mut b = Block::thinking(text, PROVIDER_ID);
                    if let Some(sig) = part.get("thoughtSignature") {
                        b.extra_fields.insert(SIGNATURE_KEY.into(), sig.clone());
                    }
                    out.push(StreamChunk::block(candidate_index, THINKING_INDEX, b));
                } else if !text.is_empty() {
                    out.push(StreamChunk::block(candidate_index, TEXT_INDEX, Block::text(text)));
                }
            }
        }
    }

    if let Some(u) = v.get("usageMetadata") {
        let mut meta = UsageMetadata::new();
        usage::set_u64(&mut meta, usage::INPUT_TOKENS, u["promptTokenCount"].as_u64().unwrap_or(0));
        let generated = u["candidatesTokenCount"].as_u64().unwrap_or(0)
            + u["thoughtsTokenCount"].as_u64().unwrap_or(0);
        usage::set_u64(&mut meta, usage::GENERATION_TOKENS, generated);
        usage::set_u64(
            &mut meta,
            usage::CACHE_READ_TOKENS,
            u["cachedContentTokenCount"].as_u64().unwrap_or(0),
        );
        usage::set_u64(&mut meta, usage::CACHE_WRITE_TOKENS, 0);
        out.push(StreamChunk::usage(meta));
    }

    out
}

fn content_part(b: &Block) -> Value {
    match b.modality {
        Modality::Text => json!({ "text": b.content }),
        // Gemini accepts every binary modality this model carries as
        // inline_data (images, audio, video, PDFs).
        _ => json!({ "inlineData": { "mimeType": b.mime_type, "data": b.content } }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
