// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Panic containment.
//!
//! [`PanicCatcher`] sits directly on the raw provider adapter, below every
//! other wrapper, converting an unwinding panic into [`GenError::Panic`] so
//! one misbehaving adapter cannot take down the conversation loop.  Tool
//! callbacks run user-defined code and get the identical treatment through
//! [`PanicSafeCallback`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use quill_model::{
    Dialog, GenError, GenOpts, Generator, Message, Response, Result, ToolCallback,
};

pub struct PanicCatcher {
    inner: Arc<dyn Generator>,
}

impl PanicCatcher {
    pub fn new(inner: Arc<dyn Generator>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Generator for PanicCatcher {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        opts: &GenOpts,
    ) -> Result<Response> {
        match AssertUnwindSafe(self.inner.generate(ctx, dialog, opts)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(GenError::Panic(panic_message(payload))),
        }
    }
}

/// Wraps a tool callback so a panicking tool surfaces as an error instead of
/// unwinding through the tool loop.
pub struct PanicSafeCallback {
    inner: Arc<dyn ToolCallback>,
}

impl PanicSafeCallback {
    pub fn new(inner: Arc<dyn ToolCallback>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ToolCallback for PanicSafeCallback {
    async fn call(
        &self,
        ctx: &CancellationToken,
        raw_params: &[u8],
        tool_call_id: &str,
    ) -> Result<Message> {
        match AssertUnwindSafe(self.inner.call(ctx, raw_params, tool_call_id))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(GenError::Panic(panic_message(payload))),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use quill_model::ScriptedAdapter;

    struct PanickingGenerator;

    #[async_trait]
    impl Generator for PanickingGenerator {
        async fn generate(
            &self,
            _ctx: &CancellationToken,
            _dialog: &mut Dialog,
            _opts: &GenOpts,
        ) -> Result<Response> {
            panic!("adapter exploded");
        }
    }

    struct PanickingCallback;

    #[async_trait]
    impl ToolCallback for PanickingCallback {
        async fn call(
            &self,
            _ctx: &CancellationToken,
            _raw_params: &[u8],
            _tool_call_id: &str,
        ) -> Result<Message> {
            panic!("tool exploded");
        }
    }

    #[tokio::test]
    async fn adapter_panic_becomes_panic_error() {
        let gen = PanicCatcher::new(Arc::new(PanickingGenerator));
        let mut dialog = vec![Message::user("x")];
        let err = gen
            .generate(&CancellationToken::new(), &mut dialog, &GenOpts::default())
            .await
            .unwrap_err();
        match err {
            GenError::Panic(msg) => assert!(msg.contains("adapter exploded")),
            other => panic!("expected Panic, got {other}"),
        }
    }

    #[tokio::test]
    async fn healthy_adapter_passes_through() {
        let gen = PanicCatcher::new(Arc::new(ScriptedAdapter::with_replies(&["fine"])));
        let mut dialog = vec![Message::user("x")];
        let resp = gen
            .generate(&CancellationToken::new(), &mut dialog, &GenOpts::default())
            .await
            .unwrap();
        assert_eq!(resp.candidates[0].text(), "fine");
    }

    #[tokio::test]
    async fn callback_panic_becomes_panic_error() {
        let cb = PanicSafeCallback::new(Arc::new(PanickingCallback));
        let err = cb
            .call(&CancellationToken::new(), b"{}", "tc_1")
            .await
            .unwrap_err();
        assert!(matches!(err, GenError::Panic(_)));
    }
}
