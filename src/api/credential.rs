//! Credential abstraction.
//!
//! Token acquisition lives outside the dashboard: a [`CredentialProvider`]
//! hands out opaque bearer tokens and can be asked to refresh them after the
//! server rejects one.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Opaque bearer token with an optional expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    #[must_use]
    pub const fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Raw token, only meant for transports building an `Authorization` header.
    pub fn bearer(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no credential available: {0}")]
    Unavailable(String),
    #[error("credential command failed: {0}")]
    CommandFailed(String),
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current credential, possibly cached.
    async fn get_credential(&self) -> Result<Credential, AuthError>;

    /// Obtain a new credential after the server rejected the current one.
    async fn refresh(&self) -> Result<Credential, AuthError>;
}

/// Reads the token from an environment variable on every call.
pub struct EnvCredentialProvider {
    var: String,
}

impl EnvCredentialProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    fn read(&self) -> Result<Credential, AuthError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(Credential::new(token.trim())),
            _ => Err(AuthError::Unavailable(format!("${} is not set", self.var))),
        }
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_credential(&self) -> Result<Credential, AuthError> {
        self.read()
    }

    async fn refresh(&self) -> Result<Credential, AuthError> {
        self.read()
    }
}

/// Runs a shell command that prints a token, caching the result.
///
/// The output is either the raw token or a JSON object with `accessToken`
/// and an optional `expires_on` unix timestamp.
pub struct CommandCredentialProvider {
    command: String,
    cached: Mutex<Option<Credential>>,
}

#[derive(Deserialize)]
struct TokenOutput {
    #[serde(rename = "accessToken")]
    access_token: String,
    expires_on: Option<i64>,
}

impl CommandCredentialProvider {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cached: Mutex::new(None),
        }
    }

    async fn run(&self) -> Result<Credential, AuthError> {
        debug!("Running credential command");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .output()
            .await
            .map_err(|e| AuthError::CommandFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuthError::CommandFailed(stderr.trim().to_string()));
        }

        let credential = parse_token_output(&String::from_utf8_lossy(&output.stdout))?;
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some(credential.clone());
        }
        Ok(credential)
    }
}

fn parse_token_output(stdout: &str) -> Result<Credential, AuthError> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Err(AuthError::CommandFailed("command printed no token".into()));
    }
    if let Ok(parsed) = serde_json::from_str::<TokenOutput>(stdout) {
        let credential = Credential::new(parsed.access_token);
        return Ok(
            match parsed
                .expires_on
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            {
                Some(at) => credential.with_expiry(at),
                None => credential,
            },
        );
    }
    Ok(Credential::new(stdout))
}

#[async_trait]
impl CredentialProvider for CommandCredentialProvider {
    async fn get_credential(&self) -> Result<Credential, AuthError> {
        let cached = self.cached.lock().ok().and_then(|c| c.clone());
        match cached {
            Some(credential) if !credential.is_expired(Utc::now()) => Ok(credential),
            _ => self.run().await,
        }
    }

    async fn refresh(&self) -> Result<Credential, AuthError> {
        self.run().await
    }
}

/// Hands out a fixed sequence of tokens: the first on `get_credential`, the
/// next one on each `refresh`. Used by demo mode and tests.
pub struct StaticCredentialProvider {
    tokens: Vec<String>,
    refreshes: AtomicUsize,
}

impl StaticCredentialProvider {
    pub fn new(tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn token_at(&self, index: usize) -> Result<Credential, AuthError> {
        self.tokens
            .get(index.min(self.tokens.len().saturating_sub(1)))
            .map(Credential::new)
            .ok_or_else(|| AuthError::Unavailable("no static tokens configured".into()))
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_credential(&self) -> Result<Credential, AuthError> {
        self.token_at(self.refreshes.load(Ordering::SeqCst))
    }

    async fn refresh(&self) -> Result<Credential, AuthError> {
        let index = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        self.token_at(index)
    }
}
