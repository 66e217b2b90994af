use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::MatchId;

/// Classification of every failure the engine can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    BadRequest,
    ServerError,
    Timeout,
    Network,
    /// Settlement has not been computed yet.
    ResultsPending,
    /// Rewards were paid out but no read path returns the results yet.
    ResultsTemporarilyUnavailable,
    QueueTimeout,
    InsufficientFunds,
    UserRejected,
    /// The wallet already has a waiting or active match.
    ActiveMatchConflict,
    NotFound,
    Unknown,
}

impl ErrorKind {
    /// Transport-level failures worth repeating the same call for.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::ServerError | ErrorKind::Timeout | ErrorKind::Network
        )
    }

    /// Retryable failures plus the two settlement-lag conditions.
    pub fn is_transient(&self) -> bool {
        self.is_retryable()
            || matches!(
                self,
                ErrorKind::ResultsPending | ErrorKind::ResultsTemporarilyUnavailable
            )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::ResultsPending => "results_pending",
            ErrorKind::ResultsTemporarilyUnavailable => "results_temporarily_unavailable",
            ErrorKind::QueueTimeout => "queue_timeout",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::UserRejected => "user_rejected",
            ErrorKind::ActiveMatchConflict => "active_match_conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surfaced to callers of the engine.
///
/// Carries enough context to render an actionable message and a retry
/// countdown: the match it concerns, how many attempts were spent and the
/// delay the backoff schedule would have waited next.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub match_id: Option<MatchId>,
    pub attempts: u32,
    pub retry_after: Option<Duration>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            match_id: None,
            attempts: 0,
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn queue_timeout(key: &str, waited: Duration) -> Self {
        Self::new(
            ErrorKind::QueueTimeout,
            format!("request {} waited {}ms in queue", key, waited.as_millis()),
        )
    }

    pub fn with_match(mut self, match_id: MatchId) -> Self {
        self.match_id = Some(match_id);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}
