//! Error types for the management API.

use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a failed request, used to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    RateLimited,
    Unauthorized,
    NotFound,
    Conflict,
    Fatal,
}

impl ErrorClass {
    /// Maps an HTTP status code onto an error class.
    pub const fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            404 | 410 => Self::NotFound,
            409 | 412 => Self::Conflict,
            429 => Self::RateLimited,
            408 | 500..=599 => Self::Transient,
            _ => Self::Fatal,
        }
    }
}

/// Failure reported by a [`Transport`](super::Transport) for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub class: ErrorClass,
    pub message: String,
    /// Server hint for when the next request may be sent.
    pub retry_after: Option<Duration>,
    /// The server (or the connection layer) guarantees the request had no
    /// effect, so even a non-idempotent request may be replayed.
    pub not_applied: bool,
}

impl RemoteError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
            not_applied: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorClass::RateLimited, "rate limited")
        }
    }

    #[must_use]
    pub const fn not_applied(mut self) -> Self {
        self.not_applied = true;
        self
    }
}

/// Error surfaced by the API client once its retry policy gives up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    NetworkTransient(String),
    #[error("rate limited by the server{}", retry_hint(*.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflicting change on the server: {0}")]
    Conflict(String),
    #[error("{0}")]
    Fatal(String),
}

fn retry_hint(retry_after: Option<Duration>) -> String {
    retry_after.map_or_else(String::new, |d| format!(" (retry after {}s)", d.as_secs()))
}

impl ApiError {
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NetworkTransient(_) => ErrorClass::Transient,
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::Unauthorized(_) => ErrorClass::Unauthorized,
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::Conflict(_) => ErrorClass::Conflict,
            Self::Fatal(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the error means the cached view of the resource is outdated.
    pub const fn invalidates_cache(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Conflict(_))
    }
}

impl From<RemoteError> for ApiError {
    fn from(error: RemoteError) -> Self {
        match error.class {
            ErrorClass::Transient => Self::NetworkTransient(error.message),
            ErrorClass::RateLimited => Self::RateLimited {
                retry_after: error.retry_after,
            },
            ErrorClass::Unauthorized => Self::Unauthorized(error.message),
            ErrorClass::NotFound => Self::NotFound(error.message),
            ErrorClass::Conflict => Self::Conflict(error.message),
            ErrorClass::Fatal => Self::Fatal(error.message),
        }
    }
}
