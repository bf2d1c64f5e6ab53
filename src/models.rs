//! Request and response bodies of the Apisdom endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct TextRequest<'a> {
    pub text: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastRequest<'a> {
    pub dates: &'a [String],
    pub values: &'a [f64],
    pub periods: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentResponse {
    pub text: String,
    /// `positive` or `negative`.
    pub sentiment: String,
    /// Confidence in `[0, 1]`.
    pub score: f64,
    /// Set when the service truncated the input text.
    #[serde(default)]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationResponse {
    pub text: String,
    pub is_toxic: bool,
    pub toxicity_score: f64,
    #[serde(default)]
    pub categories: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub date: String,
    pub value: f64,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResponse {
    pub predictions: Vec<Prediction>,
    /// Mean absolute percentage error of the fit.
    #[serde(default)]
    pub mape: Option<f64>,
    #[serde(default)]
    pub quality_warning: Option<String>,
}
