// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Seam between the generation pipeline and MCP tool servers.
//!
//! The subprocess/HTTP connection manager lives outside this workspace; what
//! arrives here is an already-populated connection set — per server, a live
//! session handle plus the tool descriptors it advertised.  This crate only
//! converts: descriptors into [`Tool`] schemas and sessions into
//! [`ToolCallback`]s.  Nothing in the pipeline ever speaks the MCP wire
//! protocol.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use quill_model::{GenError, Message, Result, Tool, ToolCallback};

/// One tool advertised by an MCP server.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub input_schema: Value,
    /// JSON Schema of the result, when the server provides one.  Consumed by
    /// code-mode binding generation; ignored for plain registration.
    pub output_schema: Option<Value>,
}

/// Result of one MCP tool invocation.
#[derive(Debug, Clone)]
pub struct McpToolResult {
    /// Plain text or a structured value, as the server returned it.
    pub content: Value,
    pub is_error: bool,
}

impl McpToolResult {
    /// The content as text: strings verbatim, anything else as JSON.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A live MCP session.  Implementations wrap whatever transport the
/// connection manager established (stdio subprocess, HTTP).
#[async_trait]
pub trait McpSession: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<McpToolResult>;
}

pub struct McpConnection {
    pub session: Arc<dyn McpSession>,
    pub tools: Vec<ToolDescriptor>,
}

/// Server name → connection, as handed over by the connection manager.
pub type McpConnections = HashMap<String, McpConnection>;

pub fn descriptor_to_tool(descriptor: &ToolDescriptor) -> Tool {
    Tool {
        name: descriptor.name.clone(),
        description: descriptor.description.clone(),
        input_schema: descriptor.input_schema.clone(),
    }
}

/// Callback that forwards one tool's invocations to its session.
pub struct McpToolCallback {
    session: Arc<dyn McpSession>,
    tool_name: String,
}

impl McpToolCallback {
    pub fn new(session: Arc<dyn McpSession>, tool_name: impl Into<String>) -> Self {
        Self { session, tool_name: tool_name.into() }
    }
}

#[async_trait]
impl ToolCallback for McpToolCallback {
    async fn call(
        &self,
        ctx: &CancellationToken,
        raw_params: &[u8],
        tool_call_id: &str,
    ) -> Result<Message> {
        // Arguments the model produced; unparseable ones go back to the
        // model as data rather than aborting the turn.
        let arguments: Value = match serde_json::from_slice(raw_params) {
            Ok(v) => v,
            Err(e) => {
                return Ok(Message::tool_error(
                    tool_call_id,
                    format!("invalid tool arguments: {e}"),
                ))
            }
        };

        debug!(tool = %self.tool_name, "forwarding tool call to MCP session");
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GenError::Cancelled),
            outcome = self.session.call_tool(&self.tool_name, arguments) => outcome,
        };

        match outcome {
            Ok(result) if result.is_error => {
                Ok(Message::tool_error(tool_call_id, result.content_text()))
            }
            Ok(result) => Ok(Message::tool_result(tool_call_id, result.content_text())),
            // Session transport failure: the server is gone, not the tool.
            Err(e) => Err(GenError::Transient { status: None, message: e.to_string() }),
        }
    }
}

/// Flatten a connection set into `(schema, callback)` pairs ready for the
/// tool registrar, in server-name order for determinism.  Cross-server name
/// collisions are left in; the registrar rejects duplicates and names the
/// offender.
pub fn connections_to_tools(
    connections: &McpConnections,
) -> Vec<(Tool, Arc<dyn ToolCallback>)> {
    let mut server_names: Vec<&String> = connections.keys().collect();
    server_names.sort();

    let mut out: Vec<(Tool, Arc<dyn ToolCallback>)> = Vec::new();
    for name in server_names {
        let connection = &connections[name];
        for descriptor in &connection.tools {
            out.push((
                descriptor_to_tool(descriptor),
                Arc::new(McpToolCallback::new(connection.session.clone(), &descriptor.name)),
            ));
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
