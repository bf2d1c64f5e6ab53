//! Maps one transport outcome onto succeed / fail-fatal / retry.

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;
use std::time::Duration;

use super::error::{ApiError, ErrorKind};
use super::transport::{TransportError, TransportOutcome, TransportResponse};

/// Why an attempt should be retried.
#[derive(Debug)]
pub enum RetryCause {
    /// HTTP 429, with the server-requested wait when `Retry-After` was usable.
    RateLimited { retry_after: Option<Duration> },
    /// HTTP 5xx.
    ServerError { status: StatusCode },
    /// No status obtained. The error is kept so it can be surfaced unwrapped
    /// when it happens on the last attempt.
    Transport(TransportError),
}

impl RetryCause {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetryCause::RateLimited { .. } => ErrorKind::RateLimited,
            RetryCause::ServerError { .. } => ErrorKind::ServerError,
            RetryCause::Transport(_) => ErrorKind::TransportFailure,
        }
    }

    /// Wait supplied by the server, if any.
    pub fn server_hint(&self) -> Option<Duration> {
        match self {
            RetryCause::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl std::fmt::Display for RetryCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryCause::RateLimited {
                retry_after: Some(wait),
            } => write!(f, "rate limited (retry after {}s)", wait.as_secs()),
            RetryCause::RateLimited { retry_after: None } => write!(f, "rate limited"),
            RetryCause::ServerError { status } => write!(f, "HTTP {}", status.as_u16()),
            RetryCause::Transport(e) => write!(f, "{}", e),
        }
    }
}

/// Result of classifying one attempt, before any wait is computed.
#[derive(Debug)]
pub enum Classification {
    Succeed(Value),
    FailFatal(ApiError),
    Retry(RetryCause),
}

/// Classifies a transport outcome. Rules are checked in order: 2xx, 402,
/// 401, 429, 5xx, everything else; a missing response is a transport failure.
pub fn classify(outcome: TransportOutcome) -> Classification {
    match outcome {
        Ok(response) => classify_response(response),
        Err(e) => Classification::Retry(RetryCause::Transport(e)),
    }
}

fn classify_response(response: TransportResponse) -> Classification {
    let status = response.status;

    if status.is_success() {
        return match parse_payload(&response.body) {
            Ok(payload) => Classification::Succeed(payload),
            Err(source) => Classification::FailFatal(ApiError::InvalidPayload { status, source }),
        };
    }

    match status {
        StatusCode::PAYMENT_REQUIRED => Classification::FailFatal(ApiError::InsufficientCredits),
        StatusCode::UNAUTHORIZED => Classification::FailFatal(ApiError::InvalidCredential),
        StatusCode::TOO_MANY_REQUESTS => Classification::Retry(RetryCause::RateLimited {
            retry_after: retry_after(&response.headers),
        }),
        s if s.is_server_error() => Classification::Retry(RetryCause::ServerError { status: s }),
        // Informational, redirects and remaining 4xx have no recovery semantics.
        s => Classification::FailFatal(ApiError::UnexpectedStatus {
            status: s,
            body: String::from_utf8_lossy(&response.body).trim().to_string(),
        }),
    }
}

/// An empty success body (e.g. 204) is reported as JSON `null`.
fn parse_payload(body: &[u8]) -> Result<Value, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
}

/// Reads `Retry-After` as whole seconds. Missing or unparsable values give
/// `None`; the backoff policy then applies its own default.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
