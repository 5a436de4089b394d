// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire-format tests: spin up a minimal HTTP/1.1 mock server, point an
//! adapter at it, issue one generate call, and assert both the HTTP request
//! the adapter sent and the assembled [`Response`].
//!
//! These run without API keys or external network access and exercise the
//! full adapter pipeline: payload serialization → HTTP → SSE parsing →
//! stream assembly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use quill_model::{
    usage, AnthropicAdapter, BlockType, CohereAdapter, Credential, GenError, GenOpts, Generator,
    Message, OpenAiChatAdapter, ResponsesAdapter, StreamedGenerator, ThinkingBudget,
};

// ── Minimal HTTP/1.1 mock server ──────────────────────────────────────────────

#[derive(Debug)]
struct CapturedRequest {
    path: String,
    headers: HashMap<String, String>,
    body: Value,
}

/// Bind a one-shot HTTP/1.1 server on a random loopback port.  It accepts
/// exactly one request, captures it, and replies with the given status and
/// body.  Returns the base URL and a receiver for the captured request.
async fn mock_server_once(
    status: u16,
    content_type: &'static str,
    resp_body: String,
) -> (String, tokio::sync::oneshot::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel::<CapturedRequest>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).await.unwrap();
        let path = request_line.split_whitespace().nth(1).unwrap_or("").to_string();

        let mut headers: HashMap<String, String> = HashMap::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }
            if let Some((k, v)) = trimmed.split_once(": ") {
                let key = k.to_lowercase();
                if key == "content-length" {
                    content_length = v.parse().unwrap_or(0);
                }
                headers.insert(key, v.to_string());
            }
        }

        let mut body_bytes = vec![0u8; content_length];
        reader.read_exact(&mut body_bytes).await.unwrap();
        let body: Value = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);
        let _ = tx.send(CapturedRequest { path, headers, body });

        let http_resp = format!(
            "HTTP/1.1 {status} X\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            resp_body.len(),
            resp_body,
        );
        let _ = write_half.write_all(http_resp.as_bytes()).await;
    });

    (format!("http://127.0.0.1:{port}"), rx)
}

/// Build an SSE body from `data:` payloads.
fn sse_body(events: &[Value]) -> String {
    let mut out = String::new();
    for e in events {
        out.push_str("data: ");
        out.push_str(&e.to_string());
        out.push_str("\n\n");
    }
    out.push_str("data: [DONE]\n\n");
    out
}

const TIMEOUT: Duration = Duration::from_secs(10);

// ── Anthropic ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn anthropic_request_payload_and_streamed_assembly() {
    let events = vec![
        serde_json::json!({ "type": "message_start", "message": { "usage": {
            "input_tokens": 12, "cache_read_input_tokens": 4, "cache_creation_input_tokens": 1 } } }),
        serde_json::json!({ "type": "content_block_start", "index": 0,
            "content_block": { "type": "text", "text": "" } }),
        serde_json::json!({ "type": "content_block_delta", "index": 0,
            "delta": { "type": "text_delta", "text": "Hel" } }),
        serde_json::json!({ "type": "content_block_delta", "index": 0,
            "delta": { "type": "text_delta", "text": "lo" } }),
        serde_json::json!({ "type": "message_delta", "usage": { "output_tokens": 2 } }),
        serde_json::json!({ "type": "message_stop" }),
    ];
    let (base, captured) = mock_server_once(200, "text/event-stream", sse_body(&events)).await;

    let adapter = AnthropicAdapter::new(
        "claude-sonnet-4-5".into(),
        Credential::ApiKey("test-key".into()),
        Some(base),
        Some(1024),
        Some("be brief".into()),
        TIMEOUT,
        None,
    )
    .unwrap();
    let gen = StreamedGenerator::new(Arc::new(adapter));

    let ctx = CancellationToken::new();
    let mut dialog = vec![Message::user("hello")];
    let resp = gen.generate(&ctx, &mut dialog, &GenOpts::default()).await.unwrap();

    let req = captured.await.unwrap();
    assert_eq!(req.path, "/v1/messages");
    assert_eq!(req.headers.get("x-api-key").map(String::as_str), Some("test-key"));
    assert_eq!(req.body["model"], "claude-sonnet-4-5");
    assert_eq!(req.body["system"][0]["text"], "be brief");
    assert_eq!(req.body["messages"][0]["content"][0]["text"], "hello");
    assert_eq!(req.body["stream"], serde_json::json!(true));

    assert_eq!(resp.candidates.len(), 1);
    assert_eq!(resp.candidates[0].text(), "Hello");
    assert_eq!(usage::get_u64(&resp.usage, usage::INPUT_TOKENS), 12);
    assert_eq!(usage::get_u64(&resp.usage, usage::GENERATION_TOKENS), 2);
    assert_eq!(usage::get_u64(&resp.usage, usage::CACHE_READ_TOKENS), 4);
    assert_eq!(usage::get_u64(&resp.usage, usage::CACHE_WRITE_TOKENS), 1);
}

#[tokio::test]
async fn anthropic_503_surfaces_as_transient() {
    let (base, _captured) = mock_server_once(503, "application/json", "{}".into()).await;
    let adapter = AnthropicAdapter::new(
        "claude-sonnet-4-5".into(),
        Credential::ApiKey("k".into()),
        Some(base),
        None,
        None,
        TIMEOUT,
        None,
    )
    .unwrap();
    let gen = StreamedGenerator::new(Arc::new(adapter));
    let ctx = CancellationToken::new();
    let mut dialog = vec![Message::user("x")];
    let err = gen.generate(&ctx, &mut dialog, &GenOpts::default()).await.unwrap_err();
    assert!(err.is_transient(), "503 must be retryable, got {err}");
}

#[tokio::test]
async fn anthropic_401_surfaces_as_permanent() {
    let (base, _captured) = mock_server_once(401, "application/json", "{}".into()).await;
    let adapter = AnthropicAdapter::new(
        "claude-sonnet-4-5".into(),
        Credential::ApiKey("bad".into()),
        Some(base),
        None,
        None,
        TIMEOUT,
        None,
    )
    .unwrap();
    let gen = StreamedGenerator::new(Arc::new(adapter));
    let ctx = CancellationToken::new();
    let mut dialog = vec![Message::user("x")];
    let err = gen.generate(&ctx, &mut dialog, &GenOpts::default()).await.unwrap_err();
    assert!(matches!(err, GenError::Permanent { status: Some(401), .. }), "got {err}");
}

// ── OpenAI chat completions ───────────────────────────────────────────────────

#[tokio::test]
async fn openai_chat_streams_text_and_parallel_tool_calls() {
    let events = vec![
        serde_json::json!({ "choices": [{ "index": 0, "delta": { "content": "ok, " } }] }),
        serde_json::json!({ "choices": [{ "index": 0, "delta": { "tool_calls": [
            { "index": 0, "id": "call_a", "function": { "name": "view_file", "arguments": "" } }
        ]}}]}),
        serde_json::json!({ "choices": [{ "index": 0, "delta": { "tool_calls": [
            { "index": 0, "function": { "arguments": "{\"path\":\"a\"}" } }
        ]}}]}),
        serde_json::json!({ "choices": [], "usage": {
            "prompt_tokens": 20, "completion_tokens": 6,
            "prompt_tokens_details": { "cached_tokens": 8 } } }),
    ];
    let (base, captured) = mock_server_once(200, "text/event-stream", sse_body(&events)).await;

    let adapter = OpenAiChatAdapter::new(
        "openai_chat",
        "gpt-5.2".into(),
        Credential::ApiKey("sk-test".into()),
        Some(base),
        None,
        None,
        TIMEOUT,
        None,
    )
    .unwrap();
    let gen = StreamedGenerator::new(Arc::new(adapter));
    let ctx = CancellationToken::new();
    let mut dialog = vec![Message::user("open a")];
    let resp = gen.generate(&ctx, &mut dialog, &GenOpts::default()).await.unwrap();

    let req = captured.await.unwrap();
    assert_eq!(req.path, "/chat/completions");
    assert_eq!(
        req.headers.get("authorization").map(String::as_str),
        Some("Bearer sk-test")
    );
    assert_eq!(req.body["stream_options"]["include_usage"], serde_json::json!(true));

    let blocks = &resp.candidates[0].blocks;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].content, "ok, ");
    let (name, args) = blocks[1].tool_call_parts().unwrap();
    assert_eq!(name, "view_file");
    assert_eq!(args["path"], "a");
    assert_eq!(blocks[1].id.as_deref(), Some("call_a"));
    assert_eq!(usage::get_u64(&resp.usage, usage::CACHE_READ_TOKENS), 8);
}

// ── OpenAI Responses ──────────────────────────────────────────────────────────

#[tokio::test]
async fn responses_propagates_response_id_into_every_block() {
    let events = vec![
        serde_json::json!({ "type": "response.output_item.added", "output_index": 0,
            "item": { "type": "reasoning" } }),
        serde_json::json!({ "type": "response.reasoning_summary_text.delta",
            "output_index": 0, "delta": "thinking..." }),
        serde_json::json!({ "type": "response.output_text.delta",
            "output_index": 1, "delta": "answer" }),
        serde_json::json!({ "type": "response.completed", "response": {
            "id": "resp_777",
            "usage": { "input_tokens": 9, "output_tokens": 3,
                        "input_tokens_details": { "cached_tokens": 0 } } } }),
    ];
    let (base, captured) = mock_server_once(200, "text/event-stream", sse_body(&events)).await;

    let adapter = ResponsesAdapter::new(
        "gpt-5.2".into(),
        Credential::ApiKey("sk-test".into()),
        Some(base),
        None,
        None,
        TIMEOUT,
        None,
    )
    .unwrap();
    let gen = StreamedGenerator::with_propagated_keys(
        Arc::new(adapter),
        vec![usage::RESPONSES_ID.to_string()],
    );

    let ctx = CancellationToken::new();
    let mut dialog = vec![Message::user("q")];
    let opts = GenOpts { thinking_budget: ThinkingBudget::Medium, ..GenOpts::default() };
    let resp = gen.generate(&ctx, &mut dialog, &opts).await.unwrap();

    let req = captured.await.unwrap();
    assert_eq!(req.path, "/responses");
    assert_eq!(req.body["reasoning"]["summary"], "detailed");

    let blocks = &resp.candidates[0].blocks;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].block_type, BlockType::Thinking);
    for b in blocks {
        assert_eq!(
            b.extra_fields[usage::RESPONSES_ID],
            serde_json::json!("resp_777"),
            "every block must carry the propagated response id"
        );
    }
    assert_eq!(resp.usage[usage::RESPONSES_ID], serde_json::json!("resp_777"));
}

// ── Cohere (batch) ────────────────────────────────────────────────────────────

#[tokio::test]
async fn cohere_batch_round_trip() {
    let body = serde_json::json!({
        "message": {
            "content": [{ "type": "text", "text": "bonjour" }],
        },
        "usage": { "tokens": { "input_tokens": 5, "output_tokens": 2 } }
    });
    let (base, captured) = mock_server_once(200, "application/json", body.to_string()).await;

    let adapter = CohereAdapter::new(
        "command-a-03-2025".into(),
        Credential::ApiKey("co-test".into()),
        Some(base),
        None,
        Some("sys".into()),
        TIMEOUT,
        None,
    )
    .unwrap();
    let ctx = CancellationToken::new();
    let mut dialog = vec![Message::user("salut")];
    let resp = adapter.generate(&ctx, &mut dialog, &GenOpts::default()).await.unwrap();

    let req = captured.await.unwrap();
    assert_eq!(req.path, "/v2/chat");
    assert_eq!(req.body["messages"][0]["role"], "system");
    assert_eq!(req.body["messages"][1]["content"][0]["text"], "salut");

    assert_eq!(resp.candidates[0].text(), "bonjour");
    assert_eq!(usage::get_u64(&resp.usage, usage::GENERATION_TOKENS), 2);
}
