//! Wait durations between attempts.

use std::time::Duration;

use super::error::ErrorKind;

/// Wait applied to a 429 without a usable `Retry-After` header.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Deterministic backoff: one exponential schedule per retry cause.
///
/// No jitter and no cap. Each `execute` call starts from attempt 0, nothing
/// carries over between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Base wait after a 5xx; doubled per attempt.
    pub server_error_base: Duration,
    /// Base wait after a transport failure; doubled per attempt.
    pub transport_failure_base: Duration,
    /// Wait after a 429 when the server gave no hint.
    pub rate_limit_default: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            server_error_base: Duration::from_millis(1000),
            transport_failure_base: Duration::from_millis(2000),
            rate_limit_default: DEFAULT_RATE_LIMIT_WAIT,
        }
    }
}

impl BackoffPolicy {
    /// Computes the wait before the attempt following `attempt` (0-based).
    ///
    /// Non-retryable kinds never reach this point in the executor; they get a
    /// zero wait.
    pub fn next_wait(&self, kind: ErrorKind, attempt: u32, server_hint: Option<Duration>) -> Duration {
        match kind {
            ErrorKind::RateLimited => server_hint.unwrap_or(self.rate_limit_default),
            ErrorKind::ServerError => exponential(self.server_error_base, attempt),
            ErrorKind::TransportFailure => exponential(self.transport_failure_base, attempt),
            _ => Duration::ZERO,
        }
    }
}

/// `base * 2^attempt`, saturating at `Duration::MAX`.
fn exponential(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}
