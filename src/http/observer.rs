//! Injectable hook for retry events.

use log::warn;
use std::time::Duration;

use super::error::ErrorKind;

/// Emitted once per retryable attempt, right before the executor waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    /// 0-based index of the attempt that failed.
    pub attempt: u32,
    pub max_retries: u32,
    pub cause: ErrorKind,
    /// Human-readable detail (status code, transport message).
    pub detail: String,
    pub wait: Duration,
}

pub trait RetryObserver: Send + Sync {
    fn on_retry(&self, event: &RetryEvent);
}

/// Default observer: ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RetryObserver for NoopObserver {
    fn on_retry(&self, _event: &RetryEvent) {}
}

/// Reports retries through the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl RetryObserver for LogObserver {
    fn on_retry(&self, event: &RetryEvent) {
        warn!(
            "attempt {}/{} failed ({}: {}), retrying in {}ms...",
            event.attempt + 1,
            event.max_retries,
            event.cause,
            event.detail,
            event.wait.as_millis()
        );
    }
}

impl<F> RetryObserver for F
where
    F: Fn(&RetryEvent) + Send + Sync,
{
    fn on_retry(&self, event: &RetryEvent) {
        self(event)
    }
}
