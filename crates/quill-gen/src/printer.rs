// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Output wrappers.
//!
//! Stdout/stderr discipline: stdout carries exactly the final answer text so
//! the conversation pipes cleanly into other tools; thinking, tool calls,
//! tool results, intermediate content, and token accounting all go to
//! stderr.  A response that still carries tool calls is by definition not
//! final, so its content prints as an aside.
//!
//! [`UsagePrinter`] is the outermost wrapper: it logs per-call and
//! cumulative token usage after the full response has been printed by the
//! layers beneath it.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use quill_model::{
    usage, Block, BlockType, Dialog, GenOpts, Generator, Message, Response, Result, ToolCallback,
    UsageMetadata,
};

use crate::render::Renderer;

/// Write the final answer to stdout (no trailing framing; the renderer
/// decides line endings).
fn write_stdout(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}

fn write_stderr(text: &str) {
    eprintln!("{text}");
}

// ── Response printer ──────────────────────────────────────────────────────────

pub struct ResponsePrinter {
    inner: Arc<dyn Generator>,
    renderer: Arc<dyn Renderer>,
}

impl ResponsePrinter {
    pub fn new(inner: Arc<dyn Generator>, renderer: Arc<dyn Renderer>) -> Self {
        Self { inner, renderer }
    }
}

/// Where one block of a response should be written.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum Sink {
    Stdout,
    Stderr,
}

/// Classify each block of a candidate.  Only the last Content block of a
/// tool-call-free response is final-answer material.
pub(crate) fn route_blocks(message: &Message) -> Vec<(Sink, usize)> {
    let has_tool_calls = message.has_tool_calls();
    let last_content = message
        .blocks
        .iter()
        .rposition(|b| b.block_type == BlockType::Content);
    message
        .blocks
        .iter()
        .enumerate()
        .map(|(i, _)| {
            if !has_tool_calls && Some(i) == last_content {
                (Sink::Stdout, i)
            } else {
                (Sink::Stderr, i)
            }
        })
        .collect()
}

pub(crate) fn format_tool_call_line(block: &Block) -> String {
    match block.tool_call_parts() {
        Some((name, args)) => format!("→ {name}({args})"),
        None => "→ <malformed tool call>".to_string(),
    }
}

#[async_trait]
impl Generator for ResponsePrinter {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        opts: &GenOpts,
    ) -> Result<Response> {
        let response = self.inner.generate(ctx, dialog, opts).await?;
        if let Some(candidate) = response.candidates.first() {
            for (sink, i) in route_blocks(candidate) {
                let block = &candidate.blocks[i];
                match (sink, block.block_type) {
                    (Sink::Stdout, _) => write_stdout(&self.renderer.render(&block.content)),
                    (Sink::Stderr, BlockType::Thinking) => {
                        write_stderr(&self.renderer.render_aside(&block.content))
                    }
                    (Sink::Stderr, BlockType::ToolCall) => {
                        write_stderr(&format_tool_call_line(block))
                    }
                    (Sink::Stderr, _) => {
                        write_stderr(&self.renderer.render_aside(&block.content))
                    }
                }
            }
        }
        Ok(response)
    }
}

// ── Token-usage printer ───────────────────────────────────────────────────────

#[derive(Default)]
struct UsageTotals {
    input: AtomicU64,
    generation: AtomicU64,
    cache_read: AtomicU64,
    cache_write: AtomicU64,
}

pub struct UsagePrinter {
    inner: Arc<dyn Generator>,
    totals: UsageTotals,
}

impl UsagePrinter {
    pub fn new(inner: Arc<dyn Generator>) -> Self {
        Self { inner, totals: UsageTotals::default() }
    }
}

pub(crate) fn format_usage_line(
    call: &UsageMetadata,
    session_input: u64,
    session_generation: u64,
) -> String {
    format!(
        "tokens: input: {}, output: {}, cache read: {}, cache write: {} | session: input: {}, output: {}",
        usage::get_u64(call, usage::INPUT_TOKENS),
        usage::get_u64(call, usage::GENERATION_TOKENS),
        usage::get_u64(call, usage::CACHE_READ_TOKENS),
        usage::get_u64(call, usage::CACHE_WRITE_TOKENS),
        session_input,
        session_generation,
    )
}

#[async_trait]
impl Generator for UsagePrinter {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        opts: &GenOpts,
    ) -> Result<Response> {
        let response = self.inner.generate(ctx, dialog, opts).await?;
        let input = usage::get_u64(&response.usage, usage::INPUT_TOKENS);
        let generation = usage::get_u64(&response.usage, usage::GENERATION_TOKENS);
        self.totals.cache_read.fetch_add(
            usage::get_u64(&response.usage, usage::CACHE_READ_TOKENS),
            Ordering::Relaxed,
        );
        self.totals.cache_write.fetch_add(
            usage::get_u64(&response.usage, usage::CACHE_WRITE_TOKENS),
            Ordering::Relaxed,
        );
        let session_input = self.totals.input.fetch_add(input, Ordering::Relaxed) + input;
        let session_generation =
            self.totals.generation.fetch_add(generation, Ordering::Relaxed) + generation;
        write_stderr(&format_usage_line(&response.usage, session_input, session_generation));
        Ok(response)
    }
}

// ── Tool-result printer ───────────────────────────────────────────────────────

/// Callback decorator that renders each tool result to stderr.  Attached by
/// the tool registrar rather than the generator stack, which makes it the
/// innermost printing layer: results appear the moment a tool finishes, not
/// when the next model call returns.
pub struct PrintingToolCallback {
    inner: Arc<dyn ToolCallback>,
    renderer: Arc<dyn Renderer>,
}

impl PrintingToolCallback {
    pub fn new(inner: Arc<dyn ToolCallback>, renderer: Arc<dyn Renderer>) -> Self {
        Self { inner, renderer }
    }
}

#[async_trait]
impl ToolCallback for PrintingToolCallback {
    async fn call(
        &self,
        ctx: &CancellationToken,
        raw_params: &[u8],
        tool_call_id: &str,
    ) -> Result<Message> {
        let message = self.inner.call(ctx, raw_params, tool_call_id).await?;
        for block in &message.blocks {
            if block.block_type == BlockType::ToolResult {
                let prefix = if message.tool_result_error { "✗ " } else { "" };
                write_stderr(&format!(
                    "{prefix}{}",
                    self.renderer.render_aside(&block.content)
                ));
            }
        }
        Ok(message)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
