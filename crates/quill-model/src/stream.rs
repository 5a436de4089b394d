// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming→response adapter.
//!
//! Consumes the chunk stream of a [`StreamingGenerator`] and assembles one
//! [`Response`].  Chunks are keyed by `(candidate_index, block_index)`;
//! content is appended in arrival order and per-block metadata (id, mime,
//! extra fields) is merged first-wins, so a late signature chunk enriches the
//! block it belongs to without clobbering anything.
//!
//! [`StreamedGenerator::with_propagated_keys`] compensates for providers
//! whose batch endpoint stamps certain metadata on every block while their
//! streaming endpoint only reports it once in the usage payload: each
//! configured key found in the final usage map is copied into every block's
//! `extra_fields` (never overwriting), which makes the two paths
//! observationally equivalent.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{GenError, Result},
    generator::{Generator, StreamingGenerator},
    types::{Block, Dialog, GenOpts, Message, Response, Role, UsageMetadata},
};

pub struct StreamedGenerator {
    inner: Arc<dyn StreamingGenerator>,
    /// Usage-metadata keys to mirror into every assembled block.
    propagated_keys: Vec<String>,
}

impl StreamedGenerator {
    pub fn new(inner: Arc<dyn StreamingGenerator>) -> Self {
        Self { inner, propagated_keys: Vec::new() }
    }

    /// Assemble as [`new`], additionally mirroring `keys` from the terminal
    /// usage payload into every block.
    pub fn with_propagated_keys(inner: Arc<dyn StreamingGenerator>, keys: Vec<String>) -> Self {
        Self { inner, propagated_keys: keys }
    }
}

#[async_trait]
impl Generator for StreamedGenerator {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        opts: &GenOpts,
    ) -> Result<Response> {
        let mut stream = self.inner.stream(ctx, dialog, opts).await?;

        // BTreeMap keeps candidates and blocks in index order regardless of
        // chunk arrival interleaving.
        let mut blocks: BTreeMap<(u32, u32), Block> = BTreeMap::new();
        let mut usage = UsageMetadata::new();

        loop {
            let item = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(GenError::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let chunk = item?;

            if let Some(partial) = chunk.block {
                blocks
                    .entry((chunk.candidate_index, chunk.block_index))
                    .and_modify(|b| append_partial(b, &partial))
                    .or_insert(partial);
            }
            if let Some(u) = chunk.usage {
                for (k, v) in u {
                    usage.insert(k, v);
                }
            }
        }

        let mut candidates: BTreeMap<u32, Message> = BTreeMap::new();
        for ((candidate_index, _), mut block) in blocks {
            for key in &self.propagated_keys {
                if let Some(v) = usage.get(key) {
                    block.extra_fields.entry(key.clone()).or_insert_with(|| v.clone());
                }
            }
            candidates
                .entry(candidate_index)
                .or_insert_with(|| Message {
                    role: Role::Assistant,
                    blocks: Vec::new(),
                    tool_result_error: false,
                    extra_fields: Default::default(),
                })
                .blocks
                .push(block);
        }

        Ok(Response { candidates: candidates.into_values().collect(), usage })
    }
}

/// Merge a later partial into an existing block: content appends, identity
/// fields keep their first non-empty value, extra fields fill gaps only.
fn append_partial(block: &mut Block, partial: &Block) {
    block.content.push_str(&partial.content);
    if block.id.is_none() {
        block.id = partial.id.clone();
    }
    if block.mime_type.is_empty() {
        block.mime_type = partial.mime_type.clone();
    }
    for (k, v) in &partial.extra_fields {
        block.extra_fields.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
