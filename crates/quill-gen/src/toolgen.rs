// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The multi-round tool-use loop.
//!
//! `run` drives: model call → execute returned tool calls in order → append
//! results → repeat, until a response carries no tool calls or the round
//! budget runs out.  Tool calls within one response execute *sequentially*
//! in response order; their results are appended in the same order, one
//! ToolResult message per call, so the id correlation between a call and its
//! result is positional as well as explicit.
//!
//! Cancellation is checked before every model call and before every tool
//! execution.  Callbacks run user code and are wrapped in the panic catcher
//! at registration; a callback that *returns* an error message inside its
//! result is fed back to the model (recovering is the model's job), while a
//! transport-level `Err` aborts the loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quill_model::{
    Dialog, GenError, GenOpts, Generator, Message, Result, Tool, ToolCallback,
};

use crate::{panic::PanicSafeCallback, printer::PrintingToolCallback, render::Renderer};

pub const DEFAULT_MAX_ROUNDS: u32 = 25;

pub struct ToolGenerator {
    gen: Arc<dyn Generator>,
    /// Schemas in registration order; sent with every call.
    tools: Vec<Tool>,
    callbacks: HashMap<String, Arc<dyn ToolCallback>>,
    max_rounds: u32,
    /// When set, registered callbacks are additionally wrapped so each tool
    /// result renders to stderr as it completes.
    result_printer: Option<Arc<dyn Renderer>>,
}

impl ToolGenerator {
    pub fn new(gen: Arc<dyn Generator>, max_rounds: u32) -> Self {
        Self {
            gen,
            tools: Vec::new(),
            callbacks: HashMap::new(),
            max_rounds: if max_rounds == 0 { DEFAULT_MAX_ROUNDS } else { max_rounds },
            result_printer: None,
        }
    }

    /// Attach the tool-result printer.  Registration-time wrapping keeps the
    /// printer on the callback side of the stack, not the generator side.
    pub fn with_result_printer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.result_printer = Some(renderer);
        self
    }

    /// Register a tool.  Names must be unique; a collision is a
    /// configuration error surfaced here, before any model call.
    pub fn register_tool(&mut self, tool: Tool, callback: Arc<dyn ToolCallback>) -> Result<()> {
        if self.callbacks.contains_key(&tool.name) {
            return Err(GenError::Config(format!("duplicate tool name: {}", tool.name)));
        }
        let mut cb: Arc<dyn ToolCallback> = Arc::new(PanicSafeCallback::new(callback));
        if let Some(renderer) = &self.result_printer {
            cb = Arc::new(PrintingToolCallback::new(cb, renderer.clone()));
        }
        self.callbacks.insert(tool.name.clone(), cb);
        self.tools.push(tool);
        Ok(())
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    /// Run the loop to completion and return the grown dialog.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        mut dialog: Dialog,
        opts: &GenOpts,
    ) -> Result<Dialog> {
        let mut call_opts = opts.clone();
        call_opts.tools = self.tools.clone();

        for round in 0..self.max_rounds {
            if ctx.is_cancelled() {
                return Err(GenError::Cancelled);
            }

            let response = self.gen.generate(ctx, &mut dialog, &call_opts).await?;
            let candidate = response
                .candidates
                .into_iter()
                .next()
                .ok_or_else(|| GenError::malformed("response carried no candidates"))?;
            dialog.push(candidate);

            let calls: Vec<(String, String, String)> = dialog
                .last()
                .map(|m| {
                    m.tool_calls()
                        .filter_map(|b| {
                            let (name, params) = b.tool_call_parts()?;
                            Some((b.id.clone().unwrap_or_default(), name, params.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default();

            if calls.is_empty() {
                debug!(rounds = round + 1, "turn complete");
                return Ok(dialog);
            }

            for (call_id, name, raw_params) in calls {
                if ctx.is_cancelled() {
                    return Err(GenError::Cancelled);
                }
                let result = match self.callbacks.get(&name) {
                    Some(cb) => cb.call(ctx, raw_params.as_bytes(), &call_id).await?,
                    // Unknown tool names go back to the model as an error
                    // result; hallucinated tools are the model's to fix.
                    None => {
                        warn!(tool = %name, "model requested an unregistered tool");
                        Message::tool_error(&call_id, format!("unknown tool: {name}"))
                    }
                };
                dialog.push(result);
            }
        }

        warn!(max_rounds = self.max_rounds, "round budget exhausted; returning dialog as-is");
        Ok(dialog)
    }
}

/// Implementing [`Generator`] lets a fully-wired tool loop be embedded where
/// a plain generator is expected (sub-agents, evaluation harnesses).  The
/// returned response carries the final assistant message.
#[async_trait]
impl Generator for ToolGenerator {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        opts: &GenOpts,
    ) -> Result<quill_model::Response> {
        let grown = self.run(ctx, dialog.clone(), opts).await?;
        *dialog = grown;
        let last = dialog
            .last()
            .cloned()
            .ok_or_else(|| GenError::malformed("tool loop returned an empty dialog"))?;
        Ok(quill_model::Response { candidates: vec![last], usage: Default::default() })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
