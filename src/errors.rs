//! Error taxonomy (spec.md §7).
//!
//! Matchable errors used by the retry predicate and the task runner's
//! failure handling live here as a small enum, the way `AuthError` and
//! `RateLimitError` do in the teacher. Everything else in the crate returns
//! `anyhow::Result` with `.context(...)` at each hop.

use std::fmt;

/// The error taxonomy from spec.md §7.
#[derive(Debug, Clone)]
pub enum CoreError {
    /// Network timeout, connection reset, HTTP 5xx. Retryable.
    TransientNetwork(String),
    /// HTTP 429. Retryable, honoring `Retry-After` as a lower bound.
    RateLimited { retry_after_secs: Option<u64> },
    /// HTTP 403 or equivalent. Not retryable; host quarantine recorded.
    Blocked { host: String },
    /// CAPTCHA / challenge page detected. Scheduling-equivalent to `Blocked`.
    Challenged { host: String },
    /// Response body did not parse into the expected shape. Not retryable.
    ParseError(String),
    /// The enclosing task deadline elapsed before the operation finished.
    DeadlineExceeded,
    /// A storage operation failed outside of "already exists" swallowing.
    StorageError(String),
    /// A configuration value was present but invalid at startup.
    ConfigurationError(String),
}

impl CoreError {
    /// Whether `retry::retry` should attempt this error again.
    ///
    /// Per spec.md §4.2: network timeouts, connection resets, HTTP 5xx, and
    /// HTTP 429 (honoring `Retry-After` as a lower bound) are retryable.
    /// HTTP 4xx other than 408/429, parse errors, and blocking/challenge
    /// classifications are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::TransientNetwork(_) | CoreError::RateLimited { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::TransientNetwork(msg) => write!(f, "transient network error: {msg}"),
            CoreError::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(s) => write!(f, "rate limited (retry after {s}s)"),
                None => write!(f, "rate limited"),
            },
            CoreError::Blocked { host } => write!(f, "blocked by {host}"),
            CoreError::Challenged { host } => write!(f, "challenged by {host}"),
            CoreError::ParseError(msg) => write!(f, "parse error: {msg}"),
            CoreError::DeadlineExceeded => write!(f, "deadline_exceeded"),
            CoreError::StorageError(msg) => write!(f, "storage error: {msg}"),
            CoreError::ConfigurationError(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}
