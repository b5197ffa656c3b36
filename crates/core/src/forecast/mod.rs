//! Narrow interface to the time-series regressor.
//!
//! The pipeline only ever sees [`Forecaster`] and [`FittedModel`]; any
//! regression implementation that can fit a daily series and project it
//! forward with a confidence band can be swapped in.

pub mod pool;
pub mod trend;

use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;

use crate::domain::forecast::Observation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeasonalityMode {
    Additive,
    Multiplicative,
}

impl SeasonalityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeasonalityMode::Additive => "additive",
            SeasonalityMode::Multiplicative => "multiplicative",
        }
    }
}

impl fmt::Display for SeasonalityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeasonalityMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "additive" => Ok(SeasonalityMode::Additive),
            "multiplicative" => Ok(SeasonalityMode::Multiplicative),
            other => anyhow::bail!("unknown seasonality mode: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparameters {
    /// Flexibility of the trend; larger values follow recent shifts more closely.
    pub changepoint_prior_scale: f64,
    pub seasonality_mode: SeasonalityMode,
    /// Probability mass covered by the lower/upper band, in (0, 1).
    pub interval_width: f64,
    pub daily_seasonality: bool,
    pub weekly_seasonality: bool,
    pub yearly_seasonality: bool,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            changepoint_prior_scale: 0.05,
            seasonality_mode: SeasonalityMode::Multiplicative,
            interval_width: 0.95,
            daily_seasonality: true,
            weekly_seasonality: true,
            yearly_seasonality: true,
        }
    }
}

impl Hyperparameters {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.changepoint_prior_scale.is_finite() && self.changepoint_prior_scale > 0.0,
            "changepoint prior scale must be > 0 (got {})",
            self.changepoint_prior_scale
        );
        anyhow::ensure!(
            self.interval_width > 0.0 && self.interval_width < 1.0,
            "interval width must be in (0, 1) (got {})",
            self.interval_width
        );
        Ok(())
    }
}

/// One projected day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    #[error("not enough observations to fit (got {got}, need {need})")]
    TooFewObservations { got: usize, need: usize },

    #[error("invalid hyperparameters: {0}")]
    InvalidParameters(String),

    #[error("series cannot be modeled: {0}")]
    Degenerate(String),

    #[error("forecaster failed: {0}")]
    Other(String),
}

/// Fitting is CPU-bound and synchronous; callers run it off the async
/// executor (see [`pool::ForecastPool`]).
pub trait Forecaster: Send + Sync {
    fn name(&self) -> &'static str;

    fn fit(
        &self,
        series: &[Observation],
        params: &Hyperparameters,
    ) -> Result<Box<dyn FittedModel>, ForecastError>;
}

pub trait FittedModel: Send {
    /// Daily points strictly after the last fitted observation, in order.
    fn forecast(&self, horizon_days: u32) -> Result<Vec<ForecastPoint>, ForecastError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seasonality_mode_case_insensitively() {
        assert_eq!(
            "Multiplicative".parse::<SeasonalityMode>().unwrap(),
            SeasonalityMode::Multiplicative
        );
        assert_eq!(
            " additive ".parse::<SeasonalityMode>().unwrap(),
            SeasonalityMode::Additive
        );
        assert!("logistic".parse::<SeasonalityMode>().is_err());
    }

    #[test]
    fn rejects_out_of_range_interval_width() {
        let params = Hyperparameters {
            interval_width: 1.0,
            ..Hyperparameters::default()
        };
        assert!(params.validate().is_err());
        assert!(Hyperparameters::default().validate().is_ok());
    }
}
