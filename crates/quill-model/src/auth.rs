// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use crate::{
    error::{GenError, Result},
    generator::TokenSource,
};

/// Credential an adapter authenticates with.
#[derive(Clone)]
pub enum Credential {
    ApiKey(String),
    /// Injected OAuth source; refresh and storage live outside the core.
    Oauth(Arc<dyn TokenSource>),
    /// Local servers and SigV4 providers that take no key.
    None,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("Credential::ApiKey(…)"),
            Self::Oauth(_) => f.write_str("Credential::Oauth(…)"),
            Self::None => f.write_str("Credential::None"),
        }
    }
}

impl Credential {
    /// Read an API key from `env_name`.  Presence is asserted here — and only
    /// here — so the api-key auth method fails at construction, not mid-turn.
    pub fn from_env(env_name: &str) -> Result<Self> {
        match std::env::var(env_name) {
            Ok(v) if !v.is_empty() => Ok(Self::ApiKey(v)),
            _ => Err(GenError::Config(format!("{env_name} not set"))),
        }
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self, Self::Oauth(_))
    }

    /// Resolve the bearer/key string for this call.
    pub async fn resolve(&self) -> Result<String> {
        match self {
            Self::ApiKey(k) => Ok(k.clone()),
            Self::Oauth(src) => src.token().await,
            Self::None => Err(GenError::Config("provider requires a credential".into())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
