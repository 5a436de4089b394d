// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::{
    error::Result,
    types::{Block, Dialog, GenOpts, Message, Response, UsageMetadata},
};

/// The core contract: one model call over a dialog.
///
/// `dialog` is `&mut` because the saving middleware assigns stable ids to the
/// caller's own messages in place — the tool loop must see those ids on its
/// next iteration.  No other implementation mutates the dialog; wrappers that
/// rewrite messages (the thinking filter) pass a copy downward instead.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        opts: &GenOpts,
    ) -> Result<Response>;
}

impl std::fmt::Debug for dyn Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Generator")
    }
}

/// A partial piece of a streamed response.
///
/// Blocks are keyed by `(candidate_index, block_index)`; successive chunks
/// with the same key append to the same block.  The terminal chunk carries
/// `usage` instead of a block.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub candidate_index: u32,
    pub block_index: u32,
    pub block: Option<Block>,
    pub usage: Option<UsageMetadata>,
}

impl StreamChunk {
    pub fn block(candidate_index: u32, block_index: u32, block: Block) -> Self {
        Self { candidate_index, block_index, block: Some(block), usage: None }
    }

    pub fn usage(usage: UsageMetadata) -> Self {
        Self { usage: Some(usage), ..Self::default() }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Implemented by adapters whose vendor API streams.  The batch [`Generator`]
/// view is obtained by wrapping in [`crate::stream::StreamedGenerator`]; the
/// streaming path is always preferred when a vendor offers both, because long
/// generations hit HTTP idle timeouts on the non-streaming endpoints.
#[async_trait]
pub trait StreamingGenerator: Send + Sync {
    /// Provider id used for thinking-block origin tags.
    fn provider_id(&self) -> &str;

    async fn stream(
        &self,
        ctx: &CancellationToken,
        dialog: &Dialog,
        opts: &GenOpts,
    ) -> Result<ChunkStream>;
}

/// Executes one tool call on behalf of the model.
///
/// Must return a ToolResult-role message containing at least one block whose
/// `id` equals `tool_call_id`.  Non-fatal failures belong *inside* the
/// returned message (`tool_result_error = true`); an `Err` is a transport
/// fault and aborts the tool loop.  Callbacks must not panic — the tool loop
/// wraps them in the panic catcher regardless.
#[async_trait]
pub trait ToolCallback: Send + Sync {
    async fn call(
        &self,
        ctx: &CancellationToken,
        raw_params: &[u8],
        tool_call_id: &str,
    ) -> Result<Message>;
}

/// Opaque OAuth credential source.  Token storage and refresh live outside
/// this workspace; adapters only ask for the current bearer token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}
