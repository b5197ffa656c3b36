use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::recommendation::RecommendationLabel;

/// A row of the historical-price store as delivered by ingestion. The close
/// is kept as text; turning it into a number is the pipeline's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub ts: DateTime<Utc>,
    pub close: Option<String>,
}

impl PricePoint {
    pub fn new(ts: DateTime<Utc>, close: impl Into<String>) -> Self {
        Self {
            ts,
            close: Some(close.into()),
        }
    }
}

/// A cleaned (timestamp, closing price) pair fed to the forecaster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// Result of one forecast run. Ephemeral: returned to callers, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub symbol: String,
    pub forecast_days: u32,
    pub prediction_date: NaiveDate,
    pub current_price: f64,
    pub predicted_price: f64,
    pub change_percent: f64,
    pub recommendation: RecommendationLabel,
    pub confidence_interval_lower: f64,
    pub confidence_interval_upper: f64,
    pub created_at: DateTime<Utc>,
}
