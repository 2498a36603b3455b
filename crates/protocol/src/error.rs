use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds that cross the HTTP boundary (§7). Never carries a stack trace
/// or internal identifier — `message` is always safe to show a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    RateLimited,
    Busy,
    UpstreamUnavailable,
    AnalysisFailed,
    StorageFailed,
    SessionNotFound,
    PrivacyBlock,
    Timeout,
    Internal,
}

/// The JSON envelope returned for every HTTP error (§7).
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retry_after_ms: None }
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// Transient allocation failure (e.g. peer connection setup) — the
    /// client's offer may have been fine; retrying later may succeed (§6).
    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::new(ErrorKind::RateLimited, "too many requests").with_retry_after(retry_after_ms)
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, message)
    }

    pub fn analysis_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AnalysisFailed, message)
    }

    pub fn storage_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageFailed, message)
    }

    pub fn session_not_found() -> Self {
        Self::new(ErrorKind::SessionNotFound, "session not found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}
