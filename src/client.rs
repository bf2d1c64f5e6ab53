//! High-level client for the Apisdom endpoints.
//!
//! Each operation validates its input, builds a [`RequestSpec`] and hands it
//! to the [`RequestExecutor`]. Retries, backoff and error classification all
//! happen there.

use anyhow::{Context, Result};
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::http::{
    ApiError, ReqwestTransport, RequestExecutor, RequestSpec, RetryObserver, Transport,
};
use crate::models::{
    ForecastRequest, ForecastResponse, ModerationResponse, SentimentResponse, TextRequest,
};

pub const SENTIMENT_PATH: &str = "/api/v1/sentiment";
pub const MODERATION_PATH: &str = "/api/v1/moderacion";
pub const PREDICTIONS_PATH: &str = "/api/v1/predictions";

/// Longest text accepted by the sentiment and moderation endpoints, in characters.
pub const MAX_TEXT_CHARS: usize = 5000;
/// Fewest data points accepted by the forecasting endpoint.
pub const MIN_FORECAST_POINTS: usize = 10;
/// Largest forecast horizon.
pub const MAX_FORECAST_PERIODS: u32 = 365;

/// Input rejected before any request was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    TextTooLong { chars: usize },
    LengthMismatch { dates: usize, values: usize },
    TooFewPoints { points: usize },
    PeriodsOutOfRange { periods: u32 },
    NonFiniteValue { index: usize },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::TextTooLong { chars } => {
                write!(
                    f,
                    "Text is {} characters long; the limit is {}",
                    chars, MAX_TEXT_CHARS
                )
            }
            ValidationError::LengthMismatch { dates, values } => {
                write!(
                    f,
                    "dates and values must have the same length ({} dates, {} values)",
                    dates, values
                )
            }
            ValidationError::TooFewPoints { points } => {
                write!(
                    f,
                    "At least {} data points are required, got {}",
                    MIN_FORECAST_POINTS, points
                )
            }
            ValidationError::PeriodsOutOfRange { periods } => {
                write!(
                    f,
                    "periods must be between 1 and {}, got {}",
                    MAX_FORECAST_PERIODS, periods
                )
            }
            ValidationError::NonFiniteValue { index } => {
                write!(f, "values[{}] is not a finite number", index)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

pub struct ApisdomClient<T: Transport = ReqwestTransport> {
    executor: RequestExecutor<T>,
}

impl ApisdomClient<ReqwestTransport> {
    /// Creates a client backed by `reqwest`.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config.timeout)?;
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> ApisdomClient<T> {
    pub fn with_transport(transport: T, config: &ClientConfig) -> Result<Self> {
        debug!("Creating client with {:?}", config);
        let executor = RequestExecutor::new(transport, config.base_url.as_str(), &config.api_key)?
            .with_max_retries(config.max_retries)
            .with_backoff(config.backoff);
        Ok(Self { executor })
    }

    pub fn with_observer(mut self, observer: impl RetryObserver + 'static) -> Self {
        self.executor = self.executor.with_observer(observer);
        self
    }

    /// Sends an arbitrary request through the retrying executor.
    pub async fn execute(&self, spec: &RequestSpec) -> Result<Value, ApiError> {
        self.executor.execute(spec).await
    }

    /// Classifies the sentiment of `text` (binary model: positive / negative).
    #[tracing::instrument(skip(self, text))]
    pub async fn analyze_sentiment(&self, text: &str) -> Result<SentimentResponse> {
        validate_text(text)?;
        let spec = RequestSpec::post_json(SENTIMENT_PATH, &TextRequest { text })?;
        self.call(&spec)
            .await
            .context("Sentiment analysis failed")
    }

    /// Scores `text` for toxic content.
    #[tracing::instrument(skip(self, text))]
    pub async fn moderate_content(&self, text: &str) -> Result<ModerationResponse> {
        validate_text(text)?;
        let spec = RequestSpec::post_json(MODERATION_PATH, &TextRequest { text })?;
        self.call(&spec)
            .await
            .context("Content moderation failed")
    }

    /// Forecasts the next `periods` values of a daily series.
    ///
    /// `dates` are `YYYY-MM-DD` strings, one per value.
    #[tracing::instrument(skip(self, dates, values))]
    pub async fn forecast(
        &self,
        dates: &[String],
        values: &[f64],
        periods: u32,
    ) -> Result<ForecastResponse> {
        validate_series(dates, values, periods)?;
        let spec = RequestSpec::post_json(
            PREDICTIONS_PATH,
            &ForecastRequest {
                dates,
                values,
                periods,
            },
        )?;
        self.call(&spec)
            .await
            .context("Time-series forecast failed")
    }

    async fn call<R: DeserializeOwned>(&self, spec: &RequestSpec) -> Result<R> {
        let payload = self.executor.execute(spec).await?;
        serde_json::from_value(payload).context("Failed to parse JSON response")
    }
}

fn validate_text(text: &str) -> Result<(), ValidationError> {
    let chars = text.chars().count();
    if chars > MAX_TEXT_CHARS {
        return Err(ValidationError::TextTooLong { chars });
    }
    Ok(())
}

fn validate_series(dates: &[String], values: &[f64], periods: u32) -> Result<(), ValidationError> {
    if dates.len() != values.len() {
        return Err(ValidationError::LengthMismatch {
            dates: dates.len(),
            values: values.len(),
        });
    }
    if dates.len() < MIN_FORECAST_POINTS {
        return Err(ValidationError::TooFewPoints {
            points: dates.len(),
        });
    }
    if !(1..=MAX_FORECAST_PERIODS).contains(&periods) {
        return Err(ValidationError::PeriodsOutOfRange { periods });
    }
    // serde_json would turn NaN and infinities into `null`.
    if let Some(index) = values.iter().position(|v| !v.is_finite()) {
        return Err(ValidationError::NonFiniteValue { index });
    }
    Ok(())
}
