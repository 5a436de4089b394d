// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Error taxonomy for the generation pipeline.
//!
//! Only the retry wrapper acts on errors; every other layer forwards them.
//! The taxonomy therefore needs exactly one classification question answered
//! reliably: *is this worth retrying?*  HTTP 408, 429, and 5xx plus transport
//! failures are transient; other 4xx and malformed bodies are permanent.

use crate::types::Modality;

#[derive(Debug, thiserror::Error)]
pub enum GenError {
    /// Missing credential, unknown provider, tool-name collision.  Surfaces
    /// from constructors only.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network failure or a retryable HTTP status.  Retried until the retry
    /// budget is exhausted.
    #[error("transient provider error{}: {message}", fmt_status(.status))]
    Transient { status: Option<u16>, message: String },

    /// Client error or malformed provider response.  Never retried.
    #[error("permanent provider error{}: {message}", fmt_status(.status))]
    Permanent { status: Option<u16>, message: String },

    /// The selected provider cannot accept this input modality.
    #[error("unsupported input modality: {0:?}")]
    UnsupportedModality(Modality),

    #[error("operation cancelled")]
    Cancelled,

    /// An adapter or callback panicked; converted by the panic catcher.
    #[error("panic: {0}")]
    Panic(String),

    /// Dialog store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {s})"),
        None => String::new(),
    }
}

impl GenError {
    /// Classify an HTTP error status per the provider contract.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        if status == 408 || status == 429 || status >= 500 {
            Self::Transient { status: Some(status), message }
        } else {
            Self::Permanent { status: Some(status), message }
        }
    }

    /// Classify a reqwest transport error.  Anything that never produced a
    /// response (connect, timeout, body I/O) is transient; decode failures
    /// mean the provider answered with something we cannot read — permanent.
    pub fn transport(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Permanent { status: None, message: err.to_string() }
        } else {
            Self::Transient { status: None, message: err.to_string() }
        }
    }

    /// A malformed provider payload (missing fields, bad JSON).
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Permanent { status: None, message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

pub type Result<T> = std::result::Result<T, GenError>;

// ─── Unit tests ──────────────────────────────────────────────────────────────
