// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cross-provider thinking-block filter.
//!
//! Providers reject (or mis-handle) thinking blocks produced by someone
//! else, so before each call the filter strips any Thinking block whose
//! origin tag is not in the allow-list.  Blocks without a tag have unknown
//! origin and are dropped too — resending another provider's reasoning is
//! exactly the failure this filter exists to prevent.
//!
//! Filtering is non-destructive: the wrapped generator receives a filtered
//! copy while the caller's dialog keeps every block, so a conversation that
//! later routes back to the original provider regains its thinking context.
//! A new provider only needs to tag its blocks; no filter change required.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use quill_model::{BlockType, Dialog, GenOpts, Generator, Message, Response, Result};

pub struct ThinkingFilter {
    inner: Arc<dyn Generator>,
    allowed: HashSet<String>,
}

impl ThinkingFilter {
    pub fn new(inner: Arc<dyn Generator>, allowed: HashSet<String>) -> Self {
        Self { inner, allowed }
    }

    fn filter_message(&self, message: &Message) -> Message {
        let blocks = message
            .blocks
            .iter()
            .filter(|b| {
                b.block_type != BlockType::Thinking
                    || b.thinking_generator().is_some_and(|g| self.allowed.contains(g))
            })
            .cloned()
            .collect();
        Message { blocks, ..message.clone() }
    }
}

#[async_trait]
impl Generator for ThinkingFilter {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        opts: &GenOpts,
    ) -> Result<Response> {
        // The saver sits outside this filter and has already attached ids,
        // and nothing below this layer mutates the dialog — so handing the
        // inner generator a filtered copy loses nothing.
        let mut filtered: Dialog = dialog.iter().map(|m| self.filter_message(m)).collect();
        self.inner.generate(ctx, &mut filtered, opts).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
