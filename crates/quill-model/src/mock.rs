// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic mock generators for tests and offline runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{GenError, Result},
    generator::Generator,
    types::{usage, Dialog, GenOpts, Message, Response, Role, UsageMetadata},
};

/// Echoes the last user message back as the assistant response.
#[derive(Default)]
pub struct EchoAdapter;

#[async_trait]
impl Generator for EchoAdapter {
    async fn generate(
        &self,
        _ctx: &CancellationToken,
        dialog: &mut Dialog,
        _opts: &GenOpts,
    ) -> Result<Response> {
        let reply = dialog
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());

        let mut meta = UsageMetadata::new();
        usage::set_u64(&mut meta, usage::INPUT_TOKENS, 10);
        usage::set_u64(&mut meta, usage::GENERATION_TOKENS, 10);
        Ok(Response {
            candidates: vec![Message::assistant(format!("MOCK: {reply}"))],
            usage: meta,
        })
    }
}

/// Pre-scripted generator: each `generate` call pops the next outcome from
/// the front of the queue.  Lets tests specify exact response sequences —
/// including tool calls and transient errors — without network access.
pub struct ScriptedAdapter {
    script: Mutex<VecDeque<Result<Response>>>,
    /// Snapshot of the dialog passed to the most recent call, so tests can
    /// assert what the adapter actually saw (e.g. after the thinking filter).
    pub last_dialog: Mutex<Option<Dialog>>,
    /// Total number of `generate` calls.
    pub calls: std::sync::atomic::AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(script: Vec<Result<Response>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last_dialog: Mutex::new(None),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Convenience: a script of plain assistant text replies.
    pub fn with_replies(replies: &[&str]) -> Self {
        Self::new(
            replies
                .iter()
                .map(|r| {
                    Ok(Response {
                        candidates: vec![Message::assistant(*r)],
                        usage: UsageMetadata::new(),
                    })
                })
                .collect(),
        )
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedAdapter {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        _opts: &GenOpts,
    ) -> Result<Response> {
        if ctx.is_cancelled() {
            return Err(GenError::Cancelled);
        }
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        *self.last_dialog.lock().unwrap() = Some(dialog.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GenError::malformed("scripted adapter exhausted")))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_replies_with_last_user_text() {
        let g = EchoAdapter;
        let ctx = CancellationToken::new();
        let mut dialog = vec![Message::user("first"), Message::assistant("a"), Message::user("second")];
        let resp = g.generate(&ctx, &mut dialog, &GenOpts::default()).await.unwrap();
        assert_eq!(resp.candidates[0].text(), "MOCK: second");
    }

    #[tokio::test]
    async fn scripted_pops_in_order_then_errors() {
        let g = ScriptedAdapter::with_replies(&["one", "two"]);
        let ctx = CancellationToken::new();
        let mut dialog = vec![Message::user("x")];
        let opts = GenOpts::default();
        assert_eq!(
            g.generate(&ctx, &mut dialog, &opts).await.unwrap().candidates[0].text(),
            "one"
        );
        assert_eq!(
            g.generate(&ctx, &mut dialog, &opts).await.unwrap().candidates[0].text(),
            "two"
        );
        assert!(g.generate(&ctx, &mut dialog, &opts).await.is_err());
        assert_eq!(g.call_count(), 3);
    }

    #[tokio::test]
    async fn scripted_records_last_dialog() {
        let g = ScriptedAdapter::with_replies(&["r"]);
        let ctx = CancellationToken::new();
        let mut dialog = vec![Message::user("inspect me")];
        g.generate(&ctx, &mut dialog, &GenOpts::default()).await.unwrap();
        let seen = g.last_dialog.lock().unwrap().clone().unwrap();
        assert_eq!(seen[0].text(), "inspect me");
    }
}
