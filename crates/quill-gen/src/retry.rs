// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Transient-error retry with exponential backoff.
//!
//! Sits *inside* the saving middleware so every message is persisted exactly
//! once no matter how many attempts the provider takes.  Only
//! [`GenError::is_transient`] errors are retried; everything else — and
//! cancellation above all — passes straight through.  Retry is idempotent by
//! construction: wrapping an already-retried generator again changes nothing
//! observable for a deterministic failure sequence, because the inner layer
//! exhausts its budget on transient errors and returns a final error the
//! outer layer treats the same way it would have.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quill_config::RetryConfig;
use quill_model::{Dialog, GenError, GenOpts, Generator, Response, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Wall-clock cap across all attempts, independent of per-call deadlines.
    pub max_elapsed: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomized to avoid thundering herds.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_secs(cfg.max_backoff_secs),
            max_elapsed: Duration::from_secs(cfg.max_elapsed_secs),
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), exponentially grown,
    /// capped, and jittered.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64);
        let jitter_range = capped * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range - jitter_range / 2.0;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

pub struct RetryGenerator {
    inner: Arc<dyn Generator>,
    policy: RetryPolicy,
}

impl RetryGenerator {
    pub fn new(inner: Arc<dyn Generator>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Generator for RetryGenerator {
    async fn generate(
        &self,
        ctx: &CancellationToken,
        dialog: &mut Dialog,
        opts: &GenOpts,
    ) -> Result<Response> {
        let started = tokio::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            let err = match self.inner.generate(ctx, dialog, opts).await {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };
            if !err.is_transient() {
                return Err(err);
            }
            attempt += 1;
            if attempt >= self.policy.max_attempts {
                warn!(attempts = attempt, "retry budget exhausted");
                return Err(err);
            }
            let delay = self.policy.backoff(attempt - 1);
            if started.elapsed() + delay > self.policy.max_elapsed {
                warn!(elapsed = ?started.elapsed(), "retry elapsed cap reached");
                return Err(err);
            }
            debug!(attempt, ?delay, error = %err, "transient provider error; backing off");
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(GenError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
