// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! AWS Bedrock driver — Converse API with SigV4 authentication, batch.
//!
//! The full SigV4 signing algorithm is implemented locally with `sha2` and
//! `hex` to avoid pulling in the AWS SDK.  Credentials come from the
//! standard env vars (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, optional
//! `AWS_SESSION_TOKEN`); region from config or `AWS_REGION`.
//!
//! Claude models on Bedrock return extended thinking as `reasoningContent`
//! blocks; these map to Thinking blocks tagged `"aws"` with the integrity
//! signature preserved.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{GenError, Result},
    generator::Generator,
    types::{
        usage, Block, BlockType, Dialog, GenOpts, Message, Modality, Response, Role,
        UsageMetadata, SIGNATURE_KEY,
    },
};

const PROVIDER_ID: &str = "aws";

pub struct BedrockAdapter {
    model: String,
    region: String,
    max_tokens: u32,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl BedrockAdapter {
    pub fn new(
        model: String,
        region: Option<String>,
        max_tokens: Option<u32>,
        system_prompt: Option<String>,
        timeout: Duration,
        client: Option<reqwest::Client>,
    ) -> Result<Self> {
        let region = region
            .or_else(|| std::env::var("AWS_REGION").ok())
            .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
            .unwrap_or_else(|| "us-east-1".into());
        Ok(Self {
            model,
            region,
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
                        let mut rt = json!({ "text": b.content });
                        if let Some(sig) = b.extra_fields.get(SIGNATURE_KEY) {
                            rt["signature"] = sig.clone();
                        }
                        content.push(json!({ "reasoningContent": { "reasoningText": rt } }));
                    }
                    BlockType::ToolCall => {
                        let (name, input) = b
                            .tool_call_parts()
                            .ok_or_else(|| GenError::malformed("tool call block without a name"))?;
                        content.push(json!({
                            "toolUse": {
                                "toolUseId": b.id.clone().unwrap_or_default(),
                                "name": name,
                                "input": input,
                            }
                        }));
                    }
                    BlockType::ToolResult => {
                        content.push(json!({
                            "toolResult": {
                                "toolUseId": b.id.clone().unwrap_or_default(),
                                "content": [{ "text": b.content }],
                                "status": if m.tool_result_error { "error" } else { "success" },
                            }
                        }));
                    }
                }
            }
            messages.push(json!({ "role": role, "content": content }));
        }

        let mut inference = json!({ "maxTokens": self.max_tokens });
        if let Some(t) = opts.temperature {
            inference["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            inference["topP"] = json!(p);
        }
        if !opts.stop_sequences.is_empty() {
            inference["stopSequences"] = json!(opts.stop_sequences);
        }

        let mut body = json!({ "messages": messages, "inferenceConfig": inference });
        if let Some(sys) = &self.system_prompt {
            if !sys.is_empty() {
                body["system"] = json!([{ "text": sys }]);
            }
        }
        if !opts.tools.is_empty() {
            let tools: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "toolSpec": {
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": { "json": t.input_schema },
                        }
                    })
                })
                .collect();
            body["toolConfig"] = json!({ "tools": tools });
        }
        if let Some(budget) = opts.thinking_budget.budget_tokens() {
            body["additionalModelRequestFields"] = json!({
                "thinking": { "type": "enabled", "budget_tokens": budget }
            });
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
impl Generator for BedrockAdapter {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        opts: &GenOpts,
    ) -> Result<Response> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| GenError::Config("AWS_ACCESS_KEY_ID not set".into()))?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| GenError::Config("AWS_SECRET_ACCESS_KEY not set".into()))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        let body = self.build_body(dialog, opts)?;
        let body_bytes =
            serde_json::to_vec(&body).map_err(|e| GenError::malformed(e.to_string()))?;

        let host = format!("bedrock-runtime.{}.amazonaws.com", self.region);
        let path = format!("/model/{}/converse", urlencoded(&self.model));
        let url = format!("https://{host}{path}");

        let now = Utc::now();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = &date_time[..8];
        let service = "bedrock";
        let content_type = "application/json";

        let headers_to_sign: Vec<(&str, &str)> = {
            let mut h = vec![
                ("content-type", content_type),
                ("host", host.as_str()),
                ("x-amz-date", date_time.as_str()),
            ];
            if let Some(tok) = &session_token {
                h.push(("x-amz-security-token", tok.as_str()));
            }
            h.sort_by_key(|&(k, _)| k);
            h
        };
        let canonical_headers: String = headers_to_sign
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k.to_lowercase(), v.trim()))
            .collect();
        let signed_headers: String = headers_to_sign
            .iter()
            .map(|(k, _)| k.to_lowercase())
            .collect::<Vec<_>>()
            .join(";");
        let body_hash = hex_sha256(&body_bytes);

        let canonical_request =
            format!("POST\n{path}\n\n{canonical_headers}\n{signed_headers}\n{body_hash}");
        let credential_scope = format!("{}/{}/{}/aws4_request", date, self.region, service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            date_time,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(secret_key.as_bytes(), date, &self.region, service);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={access_key}/{credential_scope},SignedHeaders={signed_headers},Signature={signature}"
        );

        let mut request = self
            .client
            .post(&url)
            .header("content-type", content_type)
            .header("x-amz-date", &date_time)
            .header("Authorization", &authorization)
            .body(body_bytes);
        if let Some(tok) = &session_token {
            request = request.header("x-amz-security-token", tok);
        }

        debug!(model = %self.model, region = %self.region, "sending bedrock converse request");

        let resp = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GenError::Cancelled),
            resp = request.send() => resp.map_err(GenError::transport)?,
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(GenError::from_status(status, text));
        }

        let payload: Value = resp.json().await.map_err(GenError::transport)?;
        parse_converse_response(&payload)
    }
}

/// Convert a Converse response body into a [`Response`].
pub(crate) fn parse_converse_response(payload: &Value) -> Result<Response> {
    let mut blocks: Vec<Block> = Vec::new();
    let content = payload["output"]["message"]["content"]
        .as_array()
        .ok_or_else(|| GenError::malformed("converse response missing output.message.content"))?;
    for part in content {
        if let Some(text) = part["text"].as_str() {
            blocks.push(Block::text(text));
        }
        if let Some(rt) = part["reasoningContent"]["reasoningText"].as_object() {
            let text = rt.get("text").and_then(|t| t.as_str()).unwrap_or("");
            if !text.is_empty() {
                let mut b = Block::thinking(text, PROVIDER_ID);
                if let Some(sig) = rt.get("signature") {
                    b.extra_fields.insert(SIGNATURE_KEY.into(), sig.clone());
                }
                blocks.push(b);
            }
        }
        if let Some(tu) = part.get("toolUse") {
            blocks.push(Block::tool_call(
                tu["toolUseId"].as_str().unwrap_or(""),
                tu["name"].as_str().unwrap_or(""),
                tu.get("input").cloned().unwrap_or(json!({})),
            ));
        }
    }

    let mut meta = UsageMetadata::new();
    if let Some(u) = payload.get("usage") {
        usage::set_u64(&mut meta, usage::INPUT_TOKENS, u["inputTokens"].as_u64().unwrap_or(0));
        usage::set_u64(
            &mut meta,
            usage::GENERATION_TOKENS,
            u["outputTokens"].as_u64().unwrap_or(0),
        );
        usage::set_u64(
            &mut meta,
            usage::CACHE_READ_TOKENS,
            u["cacheReadInputTokens"].as_u64().unwrap_or(0),
        );
        usage::set_u64(
            &mut meta,
            usage::CACHE_WRITE_TOKENS,
            u["cacheWriteInputTokens"].as_u64().unwrap_or(0),
        );
    }

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

fn content_block(b: &Block) -> Result<Value> {
    match b.modality {
        Modality::Text => Ok(json!({ "text": b.content })),
        Modality::Image => Ok(json!({
            "image": {
                "format": normalize_image_format(&b.mime_type),
                "source": { "bytes": b.content },
            }
        })),
        other => Err(GenError::UnsupportedModality(other)),
    }
}

// ── SigV4 helpers ─────────────────────────────────────────────────────────────

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().to_vec()
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// HMAC-SHA256 computed from the raw SHA256 primitive, no `hmac` crate.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    const BLOCK: usize = 64;
    let norm_key = if key.len() > BLOCK { sha256(key) } else { key.to_vec() };
    let mut padded = [0u8; BLOCK];
    padded[..norm_key.len()].copy_from_slice(&norm_key);
    let ipad: Vec<u8> = padded.iter().map(|&b| b ^ 0x36).collect();
    let opad: Vec<u8> = padded.iter().map(|&b| b ^ 0x5c).collect();
    let inner = {
        let mut h = Sha256::new();
        h.update(&ipad);
        h.update(data);
        h.finalize().to_vec()
    };
    let mut h = Sha256::new();
    h.update(&opad);
    h.update(&inner);
    h.finalize().to_vec()
}

fn derive_signing_key(secret: &[u8], date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = [b"AWS4", secret].concat();
    let k_date = hmac_sha256(&k_secret, date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Percent-encode everything outside the unreserved set, keeping `/` (model
/// ids contain `:` which must be encoded).
fn urlencoded(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 2);
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn normalize_image_format(mime: &str) -> String {
    let raw = mime.strip_prefix("image/").unwrap_or("jpeg");
    match raw {
        "jpg" => "jpeg".to_string(),
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
