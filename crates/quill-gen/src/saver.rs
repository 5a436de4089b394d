// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Incremental dialog persistence.
//!
//! [`SavingGenerator`] persists every new message before the wrapped call and
//! every response candidate after it, threading a linear parent chain through
//! the assigned ids.  It must sit *outside* any wrapper that rewrites
//! messages: ids are attached by mutating the caller's own dialog entries, in
//! place, so the tool loop sees them on its next iteration.  (The
//! copy-and-return alternative exists in older designs, but it hides freshly
//! assigned ids from the caller's dialog and every subsequent call re-saves
//! the same messages; in-place mutation is the variant that keeps the parent
//! chain linear.)

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use quill_model::{Dialog, GenError, GenOpts, Generator, Message, Response, Result};

/// Storage seam for persisted dialogs.
///
/// `save_message` returns a globally unique, non-empty id.  It must be safe
/// to call again on retry with the same content and parent; the middleware
/// tolerates either a repeated or a fresh id.
#[async_trait]
pub trait DialogSaver: Send + Sync {
    async fn save_message(
        &self,
        ctx: &CancellationToken,
        message: &Message,
        parent_id: &str,
        label: Option<&str>,
    ) -> Result<String>;
}

pub struct SavingGenerator {
    inner: Arc<dyn Generator>,
    saver: Arc<dyn DialogSaver>,
    label: Option<String>,
}

impl SavingGenerator {
    pub fn new(
        inner: Arc<dyn Generator>,
        saver: Arc<dyn DialogSaver>,
        label: Option<String>,
    ) -> Self {
        Self { inner, saver, label }
    }
}

#[async_trait]
impl Generator for SavingGenerator {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        opts: &GenOpts,
    ) -> Result<Response> {
        // Last already-saved message, scanning from the end; its id becomes
        // the parent of the first unsaved message.
        let start = dialog
            .iter()
            .rposition(|m| m.message_id().is_some())
            .map(|i| i + 1)
            .unwrap_or(0);
        let mut last = if start > 0 {
            dialog[start - 1].message_id().unwrap_or_default().to_string()
        } else {
            String::new()
        };

        // Pre-call: persist the caller's new messages first.  A failure here
        // bubbles immediately — proceeding would run the model on messages
        // that were never recorded.
        for message in &mut dialog[start..] {
            let id = self
                .saver
                .save_message(ctx, message, &last, self.label.as_deref())
                .await?;
            message.set_message_id(id.clone());
            last = id;
        }

        let mut response = self.inner.generate(ctx, dialog, opts).await?;

        // Post-call: persist candidates and propagate the assigned ids into
        // the returned response so downstream printers see final identities.
        // A failure here discards the response — the turn is treated as
        // failed rather than returning messages that were never recorded.
        for candidate in &mut response.candidates {
            let id = self
                .saver
                .save_message(ctx, candidate, &last, self.label.as_deref())
                .await?;
            candidate.set_message_id(id.clone());
            last = id;
        }
        debug!(chain_head = %last, "dialog persisted");
        Ok(response)
    }
}

// ─── In-memory saver ──────────────────────────────────────────────────────────

/// Record of one `save_message` call, for inspection and tests.
#[derive(Debug, Clone)]
pub struct SaveRecord {
    pub id: String,
    pub parent_id: String,
    pub label: Option<String>,
    pub message: Message,
}

/// Process-local [`DialogSaver`].  The default store when no external one is
/// injected, and the reference implementation tests run against.
#[derive(Default)]
pub struct MemorySaver {
    records: tokio::sync::Mutex<Vec<SaveRecord>>,
}

impl MemorySaver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<SaveRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DialogSaver for MemorySaver {
    async fn save_message(
        &self,
        ctx: &CancellationToken,
        message: &Message,
        parent_id: &str,
        label: Option<&str>,
    ) -> Result<String> {
        if ctx.is_cancelled() {
            return Err(GenError::Cancelled);
        }
        let id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        self.records.lock().await.push(SaveRecord {
            id: id.clone(),
            parent_id: parent_id.to_string(),
            label: label.map(String::from),
            message: message.clone(),
        });
        Ok(id)
    }
}

/// Saver stub that fails on the nth call; used to exercise the failure
/// policy.
#[cfg(test)]
pub(crate) struct FailingSaver {
    fail_on_call: usize,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FailingSaver {
    pub fn new(fail_on_call: usize) -> Self {
        Self { fail_on_call, calls: std::sync::atomic::AtomicUsize::new(0) }
    }
}

#[cfg(test)]
#[async_trait]
impl DialogSaver for FailingSaver {
    async fn save_message(
        &self,
        _ctx: &CancellationToken,
        _message: &Message,
        _parent_id: &str,
        _label: Option<&str>,
    ) -> Result<String> {
        let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n == self.fail_on_call {
            Err(GenError::Storage("simulated save failure".into()))
        } else {
            Ok(format!("msg_{n}"))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
