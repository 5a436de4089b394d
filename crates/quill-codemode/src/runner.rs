// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sandboxed script execution.
//!
//! Writes the generated preamble plus the model's code to a scratch file and
//! runs it under deno with a closed sandbox: no prompts, no filesystem, no
//! env — network restricted to the loopback bridge address.  Stdout is the
//! tool result; stderr plus a non-zero exit marks the run as failed.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use quill_model::{GenError, Result};

#[derive(Debug)]
pub struct ScriptRunner {
    runtime_path: String,
    /// Host:port the sandbox may reach — the bridge, nothing else.
    allow_net: String,
    timeout: Duration,
}

#[derive(Debug)]
pub struct ScriptOutcome {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl ScriptRunner {
    pub fn new(runtime_path: impl Into<String>, bridge_port: u16, timeout: Duration) -> Self {
        Self {
            runtime_path: runtime_path.into(),
            allow_net: format!("127.0.0.1:{bridge_port}"),
            timeout,
        }
    }

    pub async fn run(&self, ctx: &CancellationToken, source: &str) -> Result<ScriptOutcome> {
        let file = tempfile::Builder::new()
            .prefix("quill-script-")
            .suffix(".ts")
            .tempfile()
            .map_err(|e| GenError::Config(format!("script tempfile: {e}")))?;
        std::fs::write(file.path(), source)
            .map_err(|e| GenError::Config(format!("script write: {e}")))?;

        debug!(path = %file.path().display(), runtime = %self.runtime_path, "running script");

        let mut child = Command::new(&self.runtime_path)
            .arg("run")
            .arg("--quiet")
            .arg("--no-prompt")
            .arg(format!("--allow-net={}", self.allow_net))
            .arg(file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GenError::Config(format!("spawn {}: {e}", self.runtime_path)))?;

        // Drain both pipes concurrently so a chatty script cannot deadlock
        // against a full pipe buffer while we wait on exit.
        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(GenError::Cancelled);
            }
            _ = tokio::time::sleep(self.timeout) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Ok(ScriptOutcome {
                    stdout: String::new(),
                    stderr: format!("script timed out after {:?}", self.timeout),
                    success: false,
                });
            }
            status = child.wait() => {
                status.map_err(|e| GenError::Config(format!("wait on script runtime: {e}")))?
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
        Ok(ScriptOutcome { stdout, stderr, success: status.success() })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
