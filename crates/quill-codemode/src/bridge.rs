// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Loopback bridge: HTTP endpoint that scripted tool calls POST to.
//!
//! Binds `127.0.0.1:0` — the OS picks the ephemeral port, which the binding
//! generator bakes into the preamble's fetch URL.  The accept loop lives in
//! a spawned task whose shutdown is tied to the construction-time
//! cancellation token, so no task outlives the generator that started it.
//!
//! Wire protocol (loopback only):
//! request  `POST / {"tool_name": string, "arguments": object}`
//! response `{"content": string | object, "is_error": bool}`

use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quill_mcp::McpSession;
use quill_model::{GenError, Result};

#[derive(Debug, Deserialize)]
struct BridgeRequest {
    tool_name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct BridgeResponse {
    content: Value,
    is_error: bool,
}

#[derive(Clone)]
struct BridgeState {
    tools: Arc<HashMap<String, Arc<dyn McpSession>>>,
}

#[derive(Debug)]
pub struct Bridge {
    port: u16,
}

impl Bridge {
    /// Bind, spawn the accept loop, and return once the port is known.
    pub async fn start(
        tools: HashMap<String, Arc<dyn McpSession>>,
        ctx: &CancellationToken,
    ) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| GenError::Config(format!("bridge bind: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| GenError::Config(format!("bridge local_addr: {e}")))?
            .port();

        let app = Router::new()
            .route("/", post(handle_call))
            .with_state(BridgeState { tools: Arc::new(tools) });

        let shutdown = ctx.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                warn!("bridge server exited with error: {e}");
            }
        });

        debug!(port, "code-mode bridge listening");
        Ok(Self { port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }
}

async fn handle_call(
    State(state): State<BridgeState>,
    Json(request): Json<BridgeRequest>,
) -> Json<BridgeResponse> {
    let Some(session) = state.tools.get(&request.tool_name) else {
        return Json(BridgeResponse {
            content: json!(format!("unknown tool: {}", request.tool_name)),
            is_error: true,
        });
    };
    match session.call_tool(&request.tool_name, request.arguments).await {
        Ok(result) => Json(BridgeResponse { content: result.content, is_error: result.is_error }),
        Err(e) => {
            warn!(tool = %request.tool_name, "bridge tool call failed: {e}");
            Json(BridgeResponse { content: json!(e.to_string()), is_error: true })
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use quill_mcp::McpToolResult;

    use super::*;

    struct CountingSession {
        calls: std::sync::Mutex<Vec<(String, Value)>>,
        result: McpToolResult,
    }

    impl CountingSession {
        fn new(content: Value, is_error: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::Mutex::new(Vec::new()),
                result: McpToolResult { content, is_error },
            })
        }
    }

    #[async_trait]
    impl McpSession for CountingSession {
        async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<McpToolResult> {
            self.calls.lock().unwrap().push((name.to_string(), arguments));
            Ok(self.result.clone())
        }
    }

    async fn bridge_with(session: Arc<CountingSession>) -> (Bridge, CancellationToken) {
        let ctx = CancellationToken::new();
        let mut tools: HashMap<String, Arc<dyn McpSession>> = HashMap::new();
        tools.insert("get_weather".into(), session);
        let bridge = Bridge::start(tools, &ctx).await.unwrap();
        (bridge, ctx)
    }

    #[tokio::test]
    async fn round_trip_invokes_session_exactly_once() {
        let session = CountingSession::new(json!("sunny, 21C"), false);
        let (bridge, _ctx) = bridge_with(session.clone()).await;

        let resp: Value = reqwest::Client::new()
            .post(bridge.url())
            .json(&json!({ "tool_name": "get_weather", "arguments": { "city": "NYC" } }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(resp["content"], "sunny, 21C");
        assert_eq!(resp["is_error"], json!(false));
        let calls = session.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, json!({ "city": "NYC" }));
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_payload() {
        let session = CountingSession::new(json!(""), false);
        let (bridge, _ctx) = bridge_with(session.clone()).await;

        let resp: Value = reqwest::Client::new()
            .post(bridge.url())
            .json(&json!({ "tool_name": "nope", "arguments": {} }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(resp["is_error"], json!(true));
        assert!(session.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn is_error_flag_survives_the_bridge() {
        let session = CountingSession::new(json!("no such city"), true);
        let (bridge, _ctx) = bridge_with(session).await;

        let resp: Value = reqwest::Client::new()
            .post(bridge.url())
            .json(&json!({ "tool_name": "get_weather", "arguments": {} }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(resp["is_error"], json!(true));
    }

    #[tokio::test]
    async fn cancellation_shuts_the_bridge_down() {
        let session = CountingSession::new(json!(""), false);
        let (bridge, ctx) = bridge_with(session).await;
        ctx.cancel();
        // Give the accept loop a moment to wind down.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let result = reqwest::Client::new()
            .post(bridge.url())
            .json(&json!({ "tool_name": "get_weather", "arguments": {} }))
            .send()
            .await;
        assert!(result.is_err(), "bridge must stop accepting after cancellation");
    }
}
