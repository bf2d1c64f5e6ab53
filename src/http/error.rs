//! Terminal errors surfaced by the request executor.

use reqwest::StatusCode;

use super::transport::TransportError;

/// Closed set of failure kinds the executor knows about.
///
/// `RateLimited`, `ServerError` and `TransportFailure` are retry causes: the
/// executor absorbs them and only reports them as the `last_cause` of
/// [`ApiError::RetriesExhausted`] (or, for a transport failure on the final
/// attempt, as [`ApiError::Transport`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// HTTP 402: the account has no credits left.
    InsufficientCredits,
    /// HTTP 401: the API key is invalid, revoked or expired.
    InvalidCredential,
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    ServerError,
    /// No status was obtained (connection refused, timeout, DNS, ...).
    TransportFailure,
    /// Any status without defined recovery semantics (3xx, other 4xx).
    UnexpectedStatus,
    /// The attempt budget ran out without success.
    RetriesExhausted,
}

impl ErrorKind {
    /// Returns true for the kinds the executor retries internally.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::ServerError | ErrorKind::TransportFailure
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InsufficientCredits => "insufficient credits",
            ErrorKind::InvalidCredential => "invalid credential",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::ServerError => "server error",
            ErrorKind::TransportFailure => "transport failure",
            ErrorKind::UnexpectedStatus => "unexpected status",
            ErrorKind::RetriesExhausted => "retries exhausted",
        };
        f.write_str(name)
    }
}

/// The single terminal error a caller receives from one `execute` call.
#[derive(Debug)]
pub enum ApiError {
    /// HTTP 402. Never retried.
    InsufficientCredits,
    /// HTTP 401. Never retried.
    InvalidCredential,
    /// A status with no recovery semantics. Never retried.
    UnexpectedStatus { status: StatusCode, body: String },
    /// A 2xx response whose body is not JSON.
    InvalidPayload {
        status: StatusCode,
        source: serde_json::Error,
    },
    /// Transport failure on the final allowed attempt, surfaced unwrapped.
    Transport(TransportError),
    /// Every attempt ended in a retryable failure.
    RetriesExhausted {
        attempts: u32,
        last_cause: Option<ErrorKind>,
    },
}

impl ApiError {
    /// Maps this error onto the closed [`ErrorKind`] set.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::InsufficientCredits => ErrorKind::InsufficientCredits,
            ApiError::InvalidCredential => ErrorKind::InvalidCredential,
            ApiError::UnexpectedStatus { .. } | ApiError::InvalidPayload { .. } => {
                ErrorKind::UnexpectedStatus
            }
            ApiError::Transport(_) => ErrorKind::TransportFailure,
            ApiError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::InsufficientCredits => {
                write!(
                    f,
                    "Insufficient credits. Top up at https://apisdom.com/dashboard"
                )
            }
            ApiError::InvalidCredential => {
                write!(
                    f,
                    "Invalid or expired API key. Issue a new one from the dashboard."
                )
            }
            ApiError::UnexpectedStatus { status, body } if body.is_empty() => {
                write!(f, "Unexpected HTTP status {}", status.as_u16())
            }
            ApiError::UnexpectedStatus { status, body } => {
                write!(f, "Unexpected HTTP status {}: {}", status.as_u16(), body)
            }
            ApiError::InvalidPayload { status, .. } => {
                write!(
                    f,
                    "HTTP {} response body is not valid JSON",
                    status.as_u16()
                )
            }
            ApiError::Transport(e) => write!(f, "Request failed: {}", e),
            ApiError::RetriesExhausted {
                attempts,
                last_cause: Some(cause),
            } => {
                write!(
                    f,
                    "Failed after {} attempts (last cause: {})",
                    attempts, cause
                )
            }
            ApiError::RetriesExhausted { attempts, .. } => {
                write!(f, "Failed after {} attempts", attempts)
            }
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::InvalidPayload { source, .. } => Some(source),
            ApiError::Transport(e) => Some(e),
            _ => None,
        }
    }
}
