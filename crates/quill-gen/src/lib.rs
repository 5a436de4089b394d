// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The generation pipeline: ordered middleware over a provider adapter, plus
//! the multi-round tool loop.
//!
//! # Wrapper ordering
//!
//! The stack is data-driven — an ordered list of `Generator → Generator`
//! functions folded right-to-left, so source order in [`build_stack`] *is*
//! the wrapper order, outermost first:
//!
//! 1. token-usage printer (outermost — logs after everything has printed)
//! 2. response printer
//! 3. saving middleware (outside anything that rewrites messages: it
//!    assigns ids by mutating the caller's dialog in place)
//! 4. thinking-block filter (inside the saver so ids stick to unfiltered
//!    messages)
//! 5. retry (inside the saver so each save happens exactly once)
//!
//! The panic catcher wraps the raw adapter underneath the whole stack, and
//! the tool-result printer attaches via the tool registrar rather than this
//! stack.  Message-id assignment and retry can never interact: that property
//! is what this ordering exists to guarantee.

mod panic;
mod printer;
mod render;
mod retry;
mod saver;
mod thinking;
mod toolgen;

pub use panic::{PanicCatcher, PanicSafeCallback};
pub use printer::{PrintingToolCallback, ResponsePrinter, UsagePrinter};
pub use render::{AnsiRenderer, PlainRenderer, Renderer};
pub use retry::{RetryGenerator, RetryPolicy};
pub use saver::{DialogSaver, MemorySaver, SaveRecord, SavingGenerator};
pub use thinking::ThinkingFilter;
pub use toolgen::{ToolGenerator, DEFAULT_MAX_ROUNDS};

use std::collections::HashSet;
use std::sync::Arc;

use quill_model::Generator;

/// One middleware layer.
pub type Wrapper = Box<dyn FnOnce(Arc<dyn Generator>) -> Arc<dyn Generator> + Send>;

/// Fold `wrappers` over `base`, right-to-left, so the first element of
/// `wrappers` becomes the outermost layer.
pub fn compose(base: Arc<dyn Generator>, wrappers: Vec<Wrapper>) -> Arc<dyn Generator> {
    wrappers.into_iter().rev().fold(base, |inner, wrap| wrap(inner))
}

/// Everything [`build_stack`] needs beyond the adapter itself.
pub struct StackConfig {
    /// Dialog store; `None` disables persistence entirely.
    pub saver: Option<Arc<dyn DialogSaver>>,
    /// Label forwarded with every save (names the stored conversation).
    pub dialog_label: Option<String>,
    pub renderer: Arc<dyn Renderer>,
    /// Provider ids whose thinking blocks may be sent to the adapter.
    pub allowed_thinking: HashSet<String>,
    pub retry: RetryPolicy,
    /// Suppress the response and usage printers (headless embedding).
    pub disable_printing: bool,
}

impl StackConfig {
    /// Persisting, printing stack for a single provider id.
    pub fn for_provider(provider_id: &str, saver: Arc<dyn DialogSaver>) -> Self {
        Self {
            saver: Some(saver),
            dialog_label: None,
            renderer: Arc::new(PlainRenderer),
            allowed_thinking: HashSet::from([provider_id.to_string()]),
            retry: RetryPolicy::default(),
            disable_printing: false,
        }
    }

    /// Stack settings from the generation config section.
    pub fn from_config(
        cfg: &quill_config::GenConfig,
        provider_id: &str,
        saver: Option<Arc<dyn DialogSaver>>,
    ) -> Self {
        Self {
            saver,
            dialog_label: cfg.dialog_label.clone(),
            renderer: if cfg.render_markdown {
                Arc::new(AnsiRenderer)
            } else {
                Arc::new(PlainRenderer)
            },
            allowed_thinking: HashSet::from([provider_id.to_string()]),
            retry: RetryPolicy::from(&cfg.retry),
            disable_printing: cfg.disable_printing,
        }
    }
}

/// Assemble the full middleware stack over a raw adapter.  This function is
/// the only place the ordering is written down.
pub fn build_stack(adapter: Arc<dyn Generator>, config: StackConfig) -> Arc<dyn Generator> {
    let base: Arc<dyn Generator> = Arc::new(PanicCatcher::new(adapter));

    let mut layers: Vec<Wrapper> = Vec::new();
    if !config.disable_printing {
        let renderer = config.renderer.clone();
        layers.push(Box::new(|inner| Arc::new(UsagePrinter::new(inner))));
        layers.push(Box::new(move |inner| Arc::new(ResponsePrinter::new(inner, renderer))));
    }
    if let Some(saver) = config.saver {
        let label = config.dialog_label;
        layers.push(Box::new(move |inner| {
            Arc::new(SavingGenerator::new(inner, saver, label))
        }));
    }
    let allowed = config.allowed_thinking;
    layers.push(Box::new(move |inner| Arc::new(ThinkingFilter::new(inner, allowed))));
    let retry = config.retry;
    layers.push(Box::new(move |inner| Arc::new(RetryGenerator::new(inner, retry))));

    compose(base, layers)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
