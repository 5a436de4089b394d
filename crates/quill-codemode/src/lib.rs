// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Code mode: expose MCP tools to the model as a typed TypeScript runtime.
//!
//! Instead of registering each tool individually, the pipeline registers one
//! `execute_typescript` tool.  The model writes a script against generated
//! typed bindings; the script's tool calls POST to a loopback bridge that
//! proxies them to the real MCP sessions.  One round trip can thus chain
//! many tool calls, branch on intermediate results, and post-process output
//! before it ever reaches the context window.
//!
//! Tools on the configured exclusion list bypass code mode entirely and are
//! handed back for ordinary per-tool registration.

mod bridge;
mod codegen;
mod runner;

pub use bridge::Bridge;
pub use codegen::{generate_preamble, sanitize_identifier};
pub use runner::{ScriptOutcome, ScriptRunner};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use quill_config::CodeModeConfig;
use quill_mcp::{connections_to_tools, McpConnections, McpSession, ToolDescriptor};
use quill_model::{GenError, Message, Result, Tool, ToolCallback};

pub const EXECUTE_TOOL_NAME: &str = "execute_typescript";

pub struct CodeMode {
    preamble: String,
    runner: ScriptRunner,
    bridge: Bridge,
    excluded: Vec<(Tool, Arc<dyn ToolCallback>)>,
    /// Names of the tools reachable through the bridge, for the tool
    /// description shown to the model.
    bridged_names: Vec<String>,
}

impl std::fmt::Debug for CodeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeMode")
            .field("preamble", &self.preamble)
            .field("runner", &self.runner)
            .field("bridge", &self.bridge)
            .field("excluded", &self.excluded.iter().map(|(t, _)| t).collect::<Vec<_>>())
            .field("bridged_names", &self.bridged_names)
            .finish()
    }
}

impl CodeMode {
    /// Start the bridge, generate the preamble, and split out excluded
    /// tools.  The bridge task stops when `ctx` is cancelled.
    pub async fn start(
        connections: &McpConnections,
        config: &CodeModeConfig,
        ctx: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let mut bridged: Vec<ToolDescriptor> = Vec::new();
        let mut sessions: HashMap<String, Arc<dyn McpSession>> = HashMap::new();

        let mut server_names: Vec<&String> = connections.keys().collect();
        server_names.sort();
        for server in server_names {
            let connection = &connections[server];
            for descriptor in &connection.tools {
                if config.excluded_tools.contains(&descriptor.name) {
                    continue;
                }
                if sessions
                    .insert(descriptor.name.clone(), connection.session.clone())
                    .is_some()
                {
                    return Err(GenError::Config(format!(
                        "tool {:?} is offered by more than one MCP server",
                        descriptor.name
                    )));
                }
                bridged.push(descriptor.clone());
            }
        }

        let bridge = Bridge::start(sessions, ctx).await?;
        let preamble = generate_preamble(&bridged, bridge.port())?;
        let runner = ScriptRunner::new(
            config.runtime_path.clone(),
            bridge.port(),
            Duration::from_secs(config.script_timeout_secs),
        );

        let excluded = connections_to_tools(connections)
            .into_iter()
            .filter(|(tool, _)| config.excluded_tools.contains(&tool.name))
            .collect();

        debug!(
            bridged = bridged.len(),
            port = bridge.port(),
            "code mode started"
        );
        Ok(Arc::new(Self {
            preamble,
            runner,
            bridge,
            excluded,
            bridged_names: bridged.iter().map(|d| d.name.clone()).collect(),
        }))
    }

    pub fn bridge_port(&self) -> u16 {
        self.bridge.port()
    }

    pub fn preamble(&self) -> &str {
        &self.preamble
    }

    /// The single tool exposed to the model in place of the bridged set.
    pub fn tool(&self) -> Tool {
        Tool {
            name: EXECUTE_TOOL_NAME.into(),
            description: format!(
                "Run a TypeScript script. Typed async bindings are in scope for these tools: {}. \
                 Each returns Result<T> with either `value` or `error`. \
                 Whatever the script prints to stdout becomes the tool result.",
                self.bridged_names.join(", "),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "TypeScript source to execute"
                    }
                },
                "required": ["code"],
            }),
        }
    }

    pub fn callback(self: &Arc<Self>) -> Arc<dyn ToolCallback> {
        Arc::new(ExecuteCallback { mode: self.clone() })
    }

    /// Tools that bypass code mode, ready for individual registration.
    pub fn excluded_tools(&self) -> &[(Tool, Arc<dyn ToolCallback>)] {
        &self.excluded
    }
}

struct ExecuteCallback {
    mode: Arc<CodeMode>,
}

#[async_trait]
impl ToolCallback for ExecuteCallback {
    async fn call(
        &self,
        ctx: &CancellationToken,
        raw_params: &[u8],
        tool_call_id: &str,
    ) -> Result<Message> {
        #[derive(serde::Deserialize)]
        struct Params {
            code: String,
        }
        let params: Params = match serde_json::from_slice(raw_params) {
            Ok(p) => p,
            Err(e) => {
                return Ok(Message::tool_error(
                    tool_call_id,
                    format!("invalid execute_typescript arguments: {e}"),
                ))
            }
        };

        let source = format!("{}\n{}", self.mode.preamble, params.code);
        let outcome = self.mode.runner.run(ctx, &source).await?;

        if outcome.success {
            Ok(Message::tool_result(tool_call_id, outcome.stdout))
        } else {
            let detail = if outcome.stderr.is_empty() { outcome.stdout } else { outcome.stderr };
            Ok(Message::tool_error(tool_call_id, detail))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use quill_mcp::{McpConnection, McpToolResult};

    struct FakeSession {
        calls: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl McpSession for FakeSession {
        async fn call_tool(&self, _name: &str, arguments: Value) -> anyhow::Result<McpToolResult> {
            *self.calls.lock().unwrap() += 1;
            Ok(McpToolResult {
                content: json!(format!("weather for {}", arguments["city"].as_str().unwrap_or("?"))),
                is_error: false,
            })
        }
    }

    fn weather_connections(session: Arc<FakeSession>) -> McpConnections {
        let mut connections = McpConnections::new();
        connections.insert(
            "weather".into(),
            McpConnection {
                session,
                tools: vec![ToolDescriptor {
                    name: "get_weather".into(),
                    description: "look up weather".into(),
                    input_schema: json!({
                        "type": "object",
                        "properties": { "city": { "type": "string" } },
                        "required": ["city"],
                    }),
                    output_schema: Some(json!({ "type": "string" })),
                }],
            },
        );
        connections
    }

    fn deno_available() -> bool {
        std::process::Command::new("deno")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn start_generates_bindings_and_single_tool() {
        let session = Arc::new(FakeSession { calls: std::sync::Mutex::new(0) });
        let ctx = CancellationToken::new();
        let mode = CodeMode::start(
            &weather_connections(session),
            &CodeModeConfig { enabled: true, ..CodeModeConfig::default() },
            &ctx,
        )
        .await
        .unwrap();

        assert!(mode.preamble().contains("export async function get_weather"));
        let tool = mode.tool();
        assert_eq!(tool.name, EXECUTE_TOOL_NAME);
        assert!(tool.description.contains("get_weather"));
        assert!(mode.excluded_tools().is_empty());
        ctx.cancel();
    }

    #[tokio::test]
    async fn excluded_tools_bypass_the_bridge() {
        let session = Arc::new(FakeSession { calls: std::sync::Mutex::new(0) });
        let ctx = CancellationToken::new();
        let config = CodeModeConfig {
            enabled: true,
            excluded_tools: vec!["get_weather".into()],
            ..CodeModeConfig::default()
        };
        let mode = CodeMode::start(&weather_connections(session), &config, &ctx).await.unwrap();

        assert_eq!(mode.excluded_tools().len(), 1);
        assert_eq!(mode.excluded_tools()[0].0.name, "get_weather");
        assert!(!mode.preamble().contains("get_weather("), "excluded tool must not be bound");
        ctx.cancel();
    }

    #[tokio::test]
    async fn duplicate_tool_across_servers_is_rejected() {
        let session_a = Arc::new(FakeSession { calls: std::sync::Mutex::new(0) });
        let session_b = Arc::new(FakeSession { calls: std::sync::Mutex::new(0) });
        let mut connections = weather_connections(session_a);
        connections.insert(
            "weather2".into(),
            McpConnection {
                session: session_b,
                tools: vec![ToolDescriptor {
                    name: "get_weather".into(),
                    description: String::new(),
                    input_schema: json!({ "type": "object" }),
                    output_schema: None,
                }],
            },
        );
        let ctx = CancellationToken::new();
        let err = CodeMode::start(&connections, &CodeModeConfig::default(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GenError::Config(_)));
    }

    /// Scenario: the model's script calls `get_weather`; the bridge proxies
    /// to the session exactly once and the script's stdout comes back as the
    /// tool result.
    #[tokio::test]
    async fn script_round_trip_through_bridge() {
        if !deno_available() {
            eprintln!("deno not found; skipping");
            return;
        }
        let session = Arc::new(FakeSession { calls: std::sync::Mutex::new(0) });
        let ctx = CancellationToken::new();
        let mode = CodeMode::start(
            &weather_connections(session.clone()),
            &CodeModeConfig { enabled: true, ..CodeModeConfig::default() },
            &ctx,
        )
        .await
        .unwrap();

        let code = r#"
            const report = await get_weather({ city: "NYC" });
            if (report.error) throw new Error(report.error);
            console.log(report.value);
        "#;
        let params = json!({ "code": code }).to_string();
        let message = mode
            .callback()
            .call(&ctx, params.as_bytes(), "tc_script")
            .await
            .unwrap();

        assert!(!message.tool_result_error, "stderr was: {:?}", message.blocks[0].content);
        assert_eq!(message.blocks[0].content.trim(), "weather for NYC");
        assert_eq!(*session.calls.lock().unwrap(), 1, "underlying tool invoked exactly once");
        ctx.cancel();
    }

    #[tokio::test]
    async fn script_failure_comes_back_as_error_result() {
        if !deno_available() {
            eprintln!("deno not found; skipping");
            return;
        }
        let session = Arc::new(FakeSession { calls: std::sync::Mutex::new(0) });
        let ctx = CancellationToken::new();
        let mode = CodeMode::start(
            &weather_connections(session),
            &CodeModeConfig { enabled: true, ..CodeModeConfig::default() },
            &ctx,
        )
        .await
        .unwrap();

        let params = json!({ "code": "throw new Error('bad script');" }).to_string();
        let message = mode.callback().call(&ctx, params.as_bytes(), "tc_1").await.unwrap();
        assert!(message.tool_result_error);
        assert!(message.blocks[0].content.contains("bad script"));
        ctx.cancel();
    }
}
