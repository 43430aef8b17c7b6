//! Reply-reason taxonomy for admission, subscription, and auth outcomes.

use std::fmt;

/// Reason a frame was rejected or a subscription was closed, surfaced
/// verbatim as the wire-level reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    Invalid(String),
    AuthRequired,
    RateLimited,
    Blocked(String),
    Internal(String),
    Closed,
    NotFound,
    Duplicate,
}

impl RelayError {
    pub fn invalid(detail: impl Into<String>) -> Self {
        RelayError::Invalid(detail.into())
    }

    pub fn blocked(detail: impl Into<String>) -> Self {
        RelayError::Blocked(detail.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        RelayError::Internal(detail.into())
    }

    /// The exact reason string placed into `OK`/`CLOSED` reply frames.
    pub fn reason(&self) -> String {
        match self {
            RelayError::Invalid(detail) => format!("invalid: {detail}"),
            RelayError::AuthRequired => "auth-required".to_string(),
            // Bare reason, no detail suffix: rate limiting carries no
            // per-request detail worth surfacing, and every other caller in
            // this crate (admission, subscribe) already expects this exact
            // string rather than a free-form "rate-limited: ..." message.
            RelayError::RateLimited => "rate-limited".to_string(),
            RelayError::Blocked(detail) => format!("blocked: {detail}"),
            RelayError::Internal(detail) => format!("error: {detail}"),
            RelayError::Closed => "closed".to_string(),
            RelayError::NotFound => "not found".to_string(),
            RelayError::Duplicate => "duplicate".to_string(),
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl std::error::Error for RelayError {}

/// Errors a storage backend call can fail with; distinguished so the caller
/// can decide whether to retry or surface `error: database error`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage query failed: {0}")]
    QueryFailed(String),
}
