//! Forecast pipeline: history -> cleaned series -> model -> label and
//! synthesized analyst counts -> idempotent upsert.
//!
//! Public entry points never fail. Every problem is logged with its cause and
//! reported as `None`, so one bad symbol cannot take down a batch or the
//! consume loop. The `try_*` variants expose the cause for callers that need
//! to classify it.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};

use crate::config::ForecastSettings;
use crate::domain::forecast::{ForecastResult, Observation, PricePoint};
use crate::domain::recommendation::{AnalystCounts, Recommendation, RecommendationMetadata};
use crate::error::PipelineError;
use crate::forecast::pool::ForecastPool;
use crate::forecast::Forecaster;
use crate::storage::Store;

pub struct ForecastPipeline {
    store: Arc<dyn Store>,
    pool: ForecastPool,
    settings: ForecastSettings,
}

impl ForecastPipeline {
    pub fn new(store: Arc<dyn Store>, forecaster: Arc<dyn Forecaster>, settings: ForecastSettings) -> Self {
        let pool = ForecastPool::new(forecaster, settings.workers, settings.timeout);
        Self {
            store,
            pool,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn settings(&self) -> &ForecastSettings {
        &self.settings
    }

    pub fn forecaster_name(&self) -> &'static str {
        self.pool.forecaster_name()
    }

    pub async fn predict(&self, symbol: &str, horizon_days: Option<u32>) -> Option<ForecastResult> {
        match self.try_predict(symbol, horizon_days).await {
            Ok(result) => Some(result),
            Err(err) => {
                log_no_result(symbol, &err);
                None
            }
        }
    }

    /// Forecasts, persists and returns the stored row (with its original
    /// `created_at` when the (symbol, period) pair already existed).
    pub async fn generate_recommendation(
        &self,
        symbol: &str,
        horizon_days: Option<u32>,
    ) -> Option<Recommendation> {
        match self.try_generate_recommendation(symbol, horizon_days).await {
            Ok(rec) => Some(rec),
            Err(err) => {
                log_no_result(symbol, &err);
                None
            }
        }
    }

    pub async fn try_predict(
        &self,
        symbol: &str,
        horizon_days: Option<u32>,
    ) -> Result<ForecastResult, PipelineError> {
        let horizon = horizon_days.unwrap_or(self.settings.horizon_days);
        let series = self.load_series(symbol, self.settings.history_window_days).await?;
        if series.len() < self.settings.min_history_points {
            return Err(PipelineError::InsufficientData {
                got: series.len(),
                need: self.settings.min_history_points,
            });
        }

        let last = match series.last() {
            Some(obs) => *obs,
            None => return Err(PipelineError::Cleaning("empty series".to_string())),
        };
        if last.value == 0.0 {
            return Err(PipelineError::Cleaning(
                "last observed price is zero".to_string(),
            ));
        }
        let last_date = last.ts.date_naive();

        let started = std::time::Instant::now();
        let points = self
            .pool
            .run(series, self.settings.hyperparameters.clone(), horizon)
            .await?;

        let Some(target) = points.into_iter().filter(|p| p.date > last_date).last() else {
            return Err(PipelineError::Computation(format!(
                "no forecast points after {last_date}"
            )));
        };

        let current_price = last.value;
        let predicted_price = target.estimate;
        let change_percent = (predicted_price - current_price) / current_price * 100.0;
        if !change_percent.is_finite() {
            return Err(PipelineError::Computation(format!(
                "non-finite change from {current_price} to {predicted_price}"
            )));
        }
        let label = self.settings.thresholds.label_for(change_percent);

        tracing::debug!(
            symbol,
            horizon,
            forecaster = self.pool.forecaster_name(),
            elapsed_ms = started.elapsed().as_millis(),
            change_percent,
            %label,
            "forecast complete"
        );

        Ok(ForecastResult {
            symbol: symbol.to_string(),
            forecast_days: horizon,
            prediction_date: prediction_date(Utc::now().date_naive(), horizon),
            current_price,
            predicted_price,
            change_percent,
            recommendation: label,
            confidence_interval_lower: target.lower,
            confidence_interval_upper: target.upper,
            created_at: Utc::now(),
        })
    }

    pub async fn try_generate_recommendation(
        &self,
        symbol: &str,
        horizon_days: Option<u32>,
    ) -> Result<Recommendation, PipelineError> {
        let forecast = self.try_predict(symbol, horizon_days).await?;
        let rec = recommendation_from(&forecast);

        let stored = self
            .store
            .upsert_recommendation(&rec)
            .await
            .map_err(PipelineError::Persistence)?;

        tracing::info!(
            symbol,
            period = %stored.period,
            label = %forecast.recommendation,
            change_percent = forecast.change_percent,
            "recommendation stored"
        );
        Ok(stored)
    }

    /// Raw row count in a recent window, without cleaning or fitting.
    pub async fn recent_rows(&self, symbol: &str, window_days: u32) -> anyhow::Result<usize> {
        let rows = self
            .store
            .historical_prices(symbol, window_days, &self.settings.price_interval)
            .await?;
        Ok(rows.len())
    }

    async fn load_series(&self, symbol: &str, days: u32) -> Result<Vec<Observation>, PipelineError> {
        let raw = self
            .store
            .historical_prices(symbol, days, &self.settings.price_interval)
            .await
            .map_err(PipelineError::Fetch)?;
        let fetched = raw.len();
        let series = clean_series(raw);
        if series.len() < fetched {
            tracing::debug!(
                symbol,
                fetched,
                usable = series.len(),
                "dropped unusable price rows"
            );
        }
        Ok(series)
    }
}

fn log_no_result(symbol: &str, err: &PipelineError) {
    if err.is_soft() {
        tracing::info!(symbol, error = %err, "skipping forecast");
    } else {
        tracing::warn!(symbol, kind = err.kind(), error = %err, "forecast pipeline produced no result");
    }
}

/// Coerces closes to numbers, dropping anything missing, unparsable or
/// non-finite; sorts ascending and keeps the last row for a repeated
/// timestamp.
pub fn clean_series(points: Vec<PricePoint>) -> Vec<Observation> {
    let mut parsed: Vec<Observation> = points
        .into_iter()
        .filter_map(|p| {
            let value = p.close.as_deref()?.trim().parse::<f64>().ok()?;
            value.is_finite().then_some(Observation { ts: p.ts, value })
        })
        .collect();
    parsed.sort_by_key(|o| o.ts);

    let mut out: Vec<Observation> = Vec::with_capacity(parsed.len());
    for obs in parsed {
        match out.last_mut() {
            Some(prev) if prev.ts == obs.ts => *prev = obs,
            _ => out.push(obs),
        }
    }
    out
}

pub fn prediction_date(today: NaiveDate, horizon_days: u32) -> NaiveDate {
    today + Duration::days(i64::from(horizon_days))
}

pub fn recommendation_from(forecast: &ForecastResult) -> Recommendation {
    let now = Utc::now();
    Recommendation {
        id: None,
        symbol: forecast.symbol.clone(),
        period: forecast.prediction_date,
        counts: AnalystCounts::synthesize(forecast.recommendation, forecast.change_percent),
        metadata: RecommendationMetadata {
            predicted_price: forecast.predicted_price,
            current_price: forecast.current_price,
            change_percent: forecast.change_percent,
            confidence_lower: forecast.confidence_interval_lower,
            confidence_upper: forecast.confidence_interval_upper,
        },
        created_at: now,
        updated_at: now,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::domain::recommendation::RecommendationLabel;
    use crate::forecast::trend::TrendForecaster;
    use crate::storage::memory::MemoryStore;
    use chrono::TimeZone;

    #[test]
    fn cleaning_sorts_dedupes_and_drops_garbage() {
        let t = |d: u32| Utc.with_ymd_and_hms(2026, 3, d, 0, 0, 0).unwrap();
        let raw = vec![
            PricePoint::new(t(3), "103"),
            PricePoint::new(t(1), " 101.5 "),
            PricePoint { ts: t(2), close: None },
            PricePoint::new(t(4), "n/a"),
            PricePoint::new(t(3), "103.25"),
            PricePoint::new(t(5), "NaN"),
            PricePoint::new(t(6), "106"),
        ];

        let cleaned = clean_series(raw);
        let values: Vec<f64> = cleaned.iter().map(|o| o.value).collect();
        assert_eq!(values, [101.5, 103.25, 106.0]);
        assert!(cleaned.windows(2).all(|w| w[0].ts < w[1].ts));
    }

    #[test]
    fn prediction_date_adds_the_horizon() {
        let today = NaiveDate::from_ymd_opt(2026, 12, 20).unwrap();
        assert_eq!(
            prediction_date(today, 30),
            NaiveDate::from_ymd_opt(2027, 1, 19).unwrap()
        );
    }

    #[tokio::test]
    async fn short_history_is_a_soft_skip() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "TINY", 10, "50").await;
        let p = pipeline(store, FixedChange(6.0));

        assert!(p.predict("TINY", None).await.is_none());
        let err = p.try_predict("TINY", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData { got: 10, need: 30 }));
        assert!(err.is_soft());
    }

    #[tokio::test]
    async fn unparsable_rows_do_not_count_towards_history() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "MIXED", 20, "50").await;
        let now = Utc::now();
        let junk = (0..20).map(|i| PricePoint::new(now - Duration::days(60 - i), "-"));
        store.insert_prices("MIXED", "1day", junk).await;
        let p = pipeline(store, FixedChange(6.0));

        let err = p.try_predict("MIXED", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData { got: 20, .. }));
    }

    #[tokio::test]
    async fn derives_label_and_bounds_from_the_last_future_point() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "AAPL", 40, "200").await;
        let p = pipeline(store, FixedChange(6.0));

        let result = p.predict("AAPL", Some(7)).await.unwrap();
        assert_eq!(result.forecast_days, 7);
        assert_eq!(result.current_price, 200.0);
        assert!((result.predicted_price - 212.0).abs() < 1e-9);
        assert!((result.change_percent - 6.0).abs() < 1e-9);
        assert_eq!(result.recommendation, RecommendationLabel::Buy);
        assert!((result.confidence_interval_lower - 205.0).abs() < 1e-9);
        assert!((result.confidence_interval_upper - 219.0).abs() < 1e-9);
        assert_eq!(
            result.prediction_date,
            prediction_date(Utc::now().date_naive(), 7)
        );
    }

    #[tokio::test]
    async fn repeated_runs_upsert_a_single_row() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "MSFT", 40, "100").await;

        let first = pipeline(store.clone(), FixedChange(-12.0))
            .generate_recommendation("MSFT", None)
            .await
            .unwrap();
        assert_eq!(first.counts.total(), 100);
        assert_eq!(first.counts.strong_sell, 46);

        let second = pipeline(store.clone(), FixedChange(3.0))
            .generate_recommendation("MSFT", None)
            .await
            .unwrap();

        let rows = store.recommendations().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(second.period, first.period);
        assert_eq!(second.created_at, first.created_at);
        assert!(rows[0].counts.hold > rows[0].counts.sell);
        assert!((rows[0].metadata.change_percent - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn persistence_failure_yields_no_result() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "NVDA", 40, "100").await;
        store.set_fail_writes(true);
        let p = pipeline(store.clone(), FixedChange(12.0));

        assert!(p.generate_recommendation("NVDA", None).await.is_none());
        let err = p.try_generate_recommendation("NVDA", None).await.unwrap_err();
        assert_eq!(err.kind(), "persistence");
    }

    #[tokio::test]
    async fn forecaster_failures_are_computation_errors() {
        let store = Arc::new(MemoryStore::new());
        // A flat zero series cannot be fit in log space.
        seed(&store, "ZERO", 40, "0").await;
        let p = pipeline(store, TrendForecaster);

        let err = p.try_predict("ZERO", None).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Cleaning(_) | PipelineError::Computation(_)
        ));
        assert!(p.predict("ZERO", None).await.is_none());
    }

    #[tokio::test]
    async fn reference_forecaster_runs_end_to_end() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "FLAT", 60, "75").await;
        let p = pipeline(store, TrendForecaster);

        let result = p.predict("FLAT", Some(10)).await.unwrap();
        assert!((result.predicted_price - 75.0).abs() < 1e-6);
        assert_eq!(result.recommendation, RecommendationLabel::Sell);
    }
}
