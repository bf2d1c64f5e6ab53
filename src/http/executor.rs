//! The attempt loop: send, classify, back off, repeat.

use anyhow::{Context, Result};
use log::debug;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::backoff::BackoffPolicy;
use super::classify::{Classification, RetryCause, classify};
use super::error::ApiError;
use super::observer::{NoopObserver, RetryEvent, RetryObserver};
use super::transport::{Transport, TransportRequest};

/// Number of attempts made by [`RequestExecutor::execute`] unless configured otherwise.
pub const MAX_RETRIES: u32 = 3;

/// Credential header attached to every request.
pub const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");

/// One logical request, owned for the duration of one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// A POST whose body is `body` serialized as JSON.
    pub fn post_json<B: Serialize>(path: impl Into<String>, body: &B) -> Result<Self> {
        let body = serde_json::to_value(body).context("Failed to serialize request body")?;
        Ok(Self::new(Method::POST, path).with_body(body))
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// What to do after one attempt.
#[derive(Debug)]
pub enum RetryDecision {
    Succeed(Value),
    FailFatal(ApiError),
    Retry { wait: Duration, cause: RetryCause },
}

/// Drives one request through the attempt loop.
///
/// Each call to [`execute`](Self::execute) is an independent, sequential state
/// machine: the attempt counter is local to the call and nothing is shared
/// between calls, so one executor can serve concurrent callers.
pub struct RequestExecutor<T: Transport> {
    transport: T,
    base_url: String,
    api_key: HeaderValue,
    backoff: BackoffPolicy,
    observer: Arc<dyn RetryObserver>,
    max_retries: u32,
}

impl<T: Transport> RequestExecutor<T> {
    /// Creates an executor that talks to `base_url` and authenticates with `api_key`.
    pub fn new(transport: T, base_url: impl Into<String>, api_key: &str) -> Result<Self> {
        let mut api_key = HeaderValue::from_str(api_key).context("API key is not a valid header value")?;
        api_key.set_sensitive(true);

        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            transport,
            base_url,
            api_key,
            backoff: BackoffPolicy::default(),
            observer: Arc::new(NoopObserver),
            max_retries: MAX_RETRIES,
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_observer(mut self, observer: impl RetryObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Executes `spec` with the configured attempt budget.
    pub async fn execute(&self, spec: &RequestSpec) -> Result<Value, ApiError> {
        self.execute_with_retries(spec, self.max_retries).await
    }

    /// Executes `spec`, making at most `max_retries` attempts.
    ///
    /// Returns the parsed payload of the first 2xx response. 401, 402 and
    /// unclassified statuses fail on the spot. 429, 5xx and transport failures
    /// are retried after a backoff wait; once the budget is spent the call
    /// fails with [`ApiError::RetriesExhausted`], except that a transport
    /// failure on the last attempt is returned as [`ApiError::Transport`].
    #[tracing::instrument(skip(self, spec), fields(method = %spec.method, path = %spec.path))]
    pub async fn execute_with_retries(
        &self,
        spec: &RequestSpec,
        max_retries: u32,
    ) -> Result<Value, ApiError> {
        let request = self.build_request(spec);
        let mut last_cause = None;

        for attempt in 0..max_retries {
            debug!(
                "{} {}: attempt {}/{}",
                request.method,
                request.url,
                attempt + 1,
                max_retries
            );

            let outcome = self.transport.send(request.clone()).await;

            match self.decide(classify(outcome), attempt) {
                RetryDecision::Succeed(payload) => return Ok(payload),
                RetryDecision::FailFatal(e) => {
                    debug!("{} {}: non-retryable error: {}", request.method, request.url, e);
                    return Err(e);
                }
                RetryDecision::Retry { wait, cause } => {
                    last_cause = Some(cause.kind());

                    if attempt + 1 >= max_retries {
                        if let RetryCause::Transport(e) = cause {
                            return Err(ApiError::Transport(e));
                        }
                        break;
                    }

                    self.observer.on_retry(&RetryEvent {
                        attempt,
                        max_retries,
                        cause: cause.kind(),
                        detail: cause.to_string(),
                        wait,
                    });
                    self.wait(wait).await;
                }
            }
        }

        Err(ApiError::RetriesExhausted {
            attempts: max_retries,
            last_cause,
        })
    }

    /// Joins classification and backoff for one attempt.
    pub fn decide(&self, classification: Classification, attempt: u32) -> RetryDecision {
        match classification {
            Classification::Succeed(payload) => RetryDecision::Succeed(payload),
            Classification::FailFatal(e) => RetryDecision::FailFatal(e),
            Classification::Retry(cause) => {
                let wait = self
                    .backoff
                    .next_wait(cause.kind(), attempt, cause.server_hint());
                RetryDecision::Retry { wait, cause }
            }
        }
    }

    /// Suspension point between attempts. Dropping the `execute` future here
    /// cancels the timer.
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn build_request(&self, spec: &RequestSpec) -> TransportRequest {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, self.api_key.clone());

        let body = spec.body.as_ref().map(|body| {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            body.to_string().into_bytes()
        });

        TransportRequest {
            method: spec.method.clone(),
            url: format!("{}{}", self.base_url, spec.path),
            headers,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::error::ErrorKind;
    use crate::http::transport::{MockTransport, TransportError, TransportResponse};
    use mockall::Sequence;
    use reqwest::StatusCode;
    use reqwest::header::RETRY_AFTER;
    use serde_json::json;
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<RetryEvent>>>;

    fn executor(transport: MockTransport) -> (RequestExecutor<MockTransport>, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let executor = RequestExecutor::new(transport, "https://api.test/", "secret-key")
            .unwrap()
            .with_observer(move |e: &RetryEvent| sink.lock().unwrap().push(e.clone()));
        (executor, events)
    }

    fn status(code: u16) -> TransportResponse {
        TransportResponse::new(StatusCode::from_u16(code).unwrap())
    }

    fn waits(events: &Events) -> Vec<u128> {
        events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.wait.as_millis())
            .collect()
    }

    fn spec() -> RequestSpec {
        RequestSpec::get("/api/v1/thing")
    }

    #[test]
    fn test_post_json_serializes_body() {
        let spec = RequestSpec::post_json("/api/v1/sentiment", &json!({"text": "hola"})).unwrap();
        assert_eq!(spec.method, Method::POST);
        assert_eq!(spec.body, Some(json!({"text": "hola"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(status(200).with_body(r#"{"score":0.9}"#)));

        let (executor, events) = executor(transport);
        let payload = executor.execute(&spec()).await.unwrap();

        assert_eq!(payload, json!({"score": 0.9}));
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_carries_credential_and_json_body() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|req| {
                req.method == Method::POST
                    && req.url == "https://api.test/api/v1/sentiment"
                    && req.headers.get("x-api-key").map(|v| v.as_bytes()) == Some(b"secret-key".as_slice())
                    && req.headers.get(CONTENT_TYPE).map(|v| v.as_bytes())
                        == Some(b"application/json".as_slice())
                    && req.body.as_deref() == Some(br#"{"text":"hola"}"#.as_slice())
            })
            .times(1)
            .returning(|_| Ok(status(200).with_body("{}")));

        let (executor, _) = executor(transport);
        let spec = RequestSpec::post_json("/api/v1/sentiment", &json!({"text": "hola"})).unwrap();
        executor.execute(&spec).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_content_type_without_body() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|req| req.body.is_none() && req.headers.get(CONTENT_TYPE).is_none())
            .times(1)
            .returning(|_| Ok(status(200).with_body("{}")));

        let (executor, _) = executor(transport);
        executor.execute(&spec()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_statuses_make_exactly_one_attempt() {
        for (code, kind) in [
            (401, ErrorKind::InvalidCredential),
            (402, ErrorKind::InsufficientCredits),
            (418, ErrorKind::UnexpectedStatus),
        ] {
            for max_retries in [1, 3, 10] {
                let mut transport = MockTransport::new();
                transport
                    .expect_send()
                    .times(1)
                    .returning(move |_| Ok(status(code)));

                let (executor, events) = executor(transport);
                let err = executor
                    .execute_with_retries(&spec(), max_retries)
                    .await
                    .unwrap_err();

                assert_eq!(err.kind(), kind);
                assert!(events.lock().unwrap().is_empty());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_exhaust_retries() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_| Ok(status(503)));

        let (executor, events) = executor(transport);
        let err = executor.execute(&spec()).await.unwrap_err();

        assert!(matches!(
            err,
            ApiError::RetriesExhausted {
                attempts: 3,
                last_cause: Some(ErrorKind::ServerError)
            }
        ));
        assert_eq!(waits(&events), vec![1000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_schedule_over_five_attempts() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(5)
            .returning(|_| Ok(status(500)));

        let (executor, events) = executor(transport);
        let err = executor.execute_with_retries(&spec(), 5).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert_eq!(waits(&events), vec![1000, 2000, 4000, 8000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_server_error() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(status(503)));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(status(200).with_body(r#"{"text":"ok"}"#)));

        let (executor, events) = executor(transport);
        let start = tokio::time::Instant::now();
        let payload = executor.execute(&spec()).await.unwrap();

        assert_eq!(payload, json!({"text": "ok"}));
        assert_eq!(waits(&events), vec![1000]);
        assert!(start.elapsed() >= Duration::from_millis(1000));

        let events = events.lock().unwrap();
        assert_eq!(events[0].attempt, 0);
        assert_eq!(events[0].cause, ErrorKind::ServerError);
        assert_eq!(events[0].detail, "HTTP 503");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honors_retry_after() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(status(429).with_header(RETRY_AFTER, "5")));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(status(429)));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(status(200).with_body("{}")));

        let (executor, events) = executor(transport);
        executor.execute(&spec()).await.unwrap();

        assert_eq!(waits(&events), vec![5000, 60000]);
        assert!(
            events
                .lock()
                .unwrap()
                .iter()
                .all(|e| e.cause == ErrorKind::RateLimited)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_on_last_attempt_is_surfaced() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_| Err(TransportError::new("connection reset")));

        let (executor, events) = executor(transport);
        let err = executor.execute(&spec()).await.unwrap_err();

        match err {
            ApiError::Transport(e) => assert_eq!(e.message(), "connection reset"),
            other => panic!("Expected Transport error, got {:?}", other),
        }
        assert_eq!(waits(&events), vec![2000, 4000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_then_server_errors_exhaust() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(TransportError::new("timed out")));
        transport
            .expect_send()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(status(502)));

        let (executor, events) = executor(transport);
        let err = executor.execute(&spec()).await.unwrap_err();

        assert!(matches!(
            err,
            ApiError::RetriesExhausted {
                attempts: 3,
                last_cause: Some(ErrorKind::ServerError)
            }
        ));
        // Transport schedule at attempt 0, server schedule at attempt 1.
        assert_eq!(waits(&events), vec![2000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_retrying() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(status(500)));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(status(402)));

        let (executor, events) = executor(transport);
        let err = executor.execute_with_retries(&spec(), 5).await.unwrap_err();

        assert!(matches!(err, ApiError::InsufficientCredits));
        assert_eq!(waits(&events), vec![1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_are_independent() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(4).returning(|req| {
            if req.url.ends_with("/flaky") {
                Ok(status(500))
            } else {
                Ok(status(200).with_body("{}"))
            }
        });

        let (executor, events) = executor(transport);
        let flaky = RequestSpec::get("/flaky");
        let healthy = RequestSpec::get("/healthy");
        let (a, b) = tokio::join!(
            executor.execute(&flaky),
            executor.execute(&healthy)
        );

        assert_eq!(a.unwrap_err().kind(), ErrorKind::RetriesExhausted);
        assert_eq!(b.unwrap(), json!({}));
        assert_eq!(waits(&events), vec![1000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_makes_no_attempt() {
        let mut transport = MockTransport::new();
        transport.expect_send().never();

        let (executor, _) = executor(transport);
        let err = executor.execute_with_retries(&spec(), 0).await.unwrap_err();

        assert!(matches!(
            err,
            ApiError::RetriesExhausted {
                attempts: 0,
                last_cause: None
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_budget_never_waits() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(status(503)));

        let (executor, events) = executor(transport);
        let err = executor.execute_with_retries(&spec(), 1).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancelled_with_the_call() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(status(429)));

        let (executor, events) = executor(transport);
        let result =
            tokio::time::timeout(Duration::from_secs(1), executor.execute(&spec())).await;

        assert!(result.is_err());
        assert_eq!(waits(&events), vec![60000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_backoff_and_budget() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(4)
            .returning(|_| Ok(status(500)));

        let (executor, events) = executor(transport);
        let executor = executor
            .with_max_retries(4)
            .with_backoff(BackoffPolicy {
                server_error_base: Duration::from_millis(10),
                ..BackoffPolicy::default()
            });
        let err = executor.execute(&spec()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert_eq!(waits(&events), vec![10, 20, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_without_header_uses_configured_default() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(2)
            .returning(|_| Ok(status(429)));

        let (executor, events) = executor(transport);
        let executor = executor.with_max_retries(2).with_backoff(BackoffPolicy {
            rate_limit_default: Duration::from_millis(10),
            ..BackoffPolicy::default()
        });
        let err = executor.execute(&spec()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert_eq!(waits(&events), vec![10]);
        assert_eq!(events.lock().unwrap()[0].detail, "rate limited");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_on_last_attempt_exhausts_without_waiting() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(2)
            .returning(|_| Ok(status(429).with_header(RETRY_AFTER, "5")));

        let (executor, events) = executor(transport);
        let err = executor.execute_with_retries(&spec(), 2).await.unwrap_err();

        assert!(matches!(
            err,
            ApiError::RetriesExhausted {
                attempts: 2,
                last_cause: Some(ErrorKind::RateLimited)
            }
        ));
        assert_eq!(waits(&events), vec![5000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_then_transport_failure_on_last_attempt() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(status(503)));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(TransportError::new("connection reset")));

        let (executor, events) = executor(transport);
        let err = executor.execute(&spec()).await.unwrap_err();

        match err {
            ApiError::Transport(e) => assert_eq!(e.message(), "connection reset"),
            other => panic!("Expected Transport error, got {:?}", other),
        }
        assert_eq!(waits(&events), vec![1000, 2000]);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_default_observer_is_silent() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(status(500)));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(status(200).with_body("[]")));

        let executor = RequestExecutor::new(transport, "https://api.test", "k").unwrap();
        assert_eq!(executor.base_url(), "https://api.test");
        assert_eq!(executor.max_retries(), MAX_RETRIES);
        assert_eq!(executor.execute(&spec()).await.unwrap(), json!([]));
    }

    #[test]
    fn test_invalid_api_key_is_rejected() {
        let result = RequestExecutor::new(MockTransport::new(), "https://api.test", "bad\nkey");
        assert!(result.is_err());
    }
}
