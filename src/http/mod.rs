//! Request execution with error classification, backoff and retries.

mod backoff;
mod classify;
mod error;
mod executor;
mod observer;
mod transport;

pub use backoff::{BackoffPolicy, DEFAULT_RATE_LIMIT_WAIT};
pub use classify::{Classification, RetryCause, classify, retry_after};
pub use error::{ApiError, ErrorKind};
pub use executor::{API_KEY_HEADER, MAX_RETRIES, RequestExecutor, RequestSpec, RetryDecision};
pub use observer::{LogObserver, NoopObserver, RetryEvent, RetryObserver};
pub use transport::{
    ReqwestTransport, Transport, TransportError, TransportOutcome, TransportRequest,
    TransportResponse,
};

#[cfg(test)]
pub use transport::MockTransport;
