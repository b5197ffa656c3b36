//! Reference regressor: recency-weighted least-squares trend with optional
//! weekly and yearly residual profiles and a Gaussian prediction band.
//!
//! Multiplicative mode fits in log space, so seasonal offsets and the band
//! scale with the price level. The daily component only matters for
//! sub-daily data; day-granular series are modeled by trend and the weekly
//! and yearly profiles.

use chrono::{Datelike, Duration, NaiveDate};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::domain::forecast::Observation;
use crate::forecast::{
    FittedModel, ForecastError, ForecastPoint, Forecaster, Hyperparameters, SeasonalityMode,
};

const MIN_OBSERVATIONS: usize = 2;
const WEEKLY_MIN_SPAN_DAYS: f64 = 14.0;
const YEARLY_MIN_SPAN_DAYS: f64 = 730.0;
// Per-day decay of observation weight per unit of changepoint prior scale.
const RECENCY_DECAY: f64 = 0.1;

#[derive(Debug, Clone, Copy, Default)]
pub struct TrendForecaster;

impl Forecaster for TrendForecaster {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn fit(
        &self,
        series: &[Observation],
        params: &Hyperparameters,
    ) -> Result<Box<dyn FittedModel>, ForecastError> {
        params
            .validate()
            .map_err(|e| ForecastError::InvalidParameters(e.to_string()))?;

        let (first, last) = match (series.first(), series.last()) {
            (Some(first), Some(last)) if series.len() >= MIN_OBSERVATIONS => (first, last),
            _ => {
                return Err(ForecastError::TooFewObservations {
                    got: series.len(),
                    need: MIN_OBSERVATIONS,
                })
            }
        };

        let origin = first.ts.date_naive();
        let last_date = last.ts.date_naive();

        let xs: Vec<f64> = series
            .iter()
            .map(|o| (o.ts.date_naive() - origin).num_days() as f64)
            .collect();
        let ys: Vec<f64> = match params.seasonality_mode {
            SeasonalityMode::Additive => series.iter().map(|o| o.value).collect(),
            SeasonalityMode::Multiplicative => {
                if let Some(bad) = series.iter().find(|o| o.value <= 0.0) {
                    return Err(ForecastError::Degenerate(format!(
                        "multiplicative mode needs positive values (got {} at {})",
                        bad.value, bad.ts
                    )));
                }
                series.iter().map(|o| o.value.ln()).collect()
            }
        };

        let x_last = xs[xs.len() - 1];
        let span = x_last - xs[0];
        let decay = params.changepoint_prior_scale * RECENCY_DECAY;
        let weights: Vec<f64> = xs.iter().map(|x| (-decay * (x_last - x)).exp()).collect();

        let (intercept, slope) = weighted_least_squares(&xs, &ys, &weights).ok_or_else(|| {
            ForecastError::Degenerate("all observations fall on the same day".to_string())
        })?;

        let mut residuals: Vec<f64> = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| y - (intercept + slope * x))
            .collect();

        let weekly = if params.weekly_seasonality && span >= WEEKLY_MIN_SPAN_DAYS {
            let profile = SeasonalProfile::fit(series, &residuals, &weights, Period::Weekly);
            profile.remove_from(series, &mut residuals);
            Some(profile)
        } else {
            None
        };

        let yearly = if params.yearly_seasonality && span >= YEARLY_MIN_SPAN_DAYS {
            let profile = SeasonalProfile::fit(series, &residuals, &weights, Period::Yearly);
            profile.remove_from(series, &mut residuals);
            Some(profile)
        } else {
            None
        };

        let weight_sum: f64 = weights.iter().sum();
        let sigma = (residuals
            .iter()
            .zip(&weights)
            .map(|(r, w)| w * r * r)
            .sum::<f64>()
            / weight_sum)
            .sqrt();

        let normal =
            Normal::new(0.0, 1.0).map_err(|e| ForecastError::Other(format!("normal: {e}")))?;
        let z = normal.inverse_cdf(0.5 + params.interval_width / 2.0);

        Ok(Box::new(TrendModel {
            origin,
            last_date,
            n: series.len(),
            intercept,
            slope,
            weekly,
            yearly,
            sigma,
            z,
            mode: params.seasonality_mode,
        }))
    }
}

struct TrendModel {
    origin: NaiveDate,
    last_date: NaiveDate,
    n: usize,
    intercept: f64,
    slope: f64,
    weekly: Option<SeasonalProfile>,
    yearly: Option<SeasonalProfile>,
    sigma: f64,
    z: f64,
    mode: SeasonalityMode,
}

impl TrendModel {
    fn seasonal_at(&self, date: NaiveDate) -> f64 {
        let weekly = self.weekly.as_ref().map_or(0.0, |p| p.at(date));
        let yearly = self.yearly.as_ref().map_or(0.0, |p| p.at(date));
        weekly + yearly
    }
}

impl FittedModel for TrendModel {
    fn forecast(&self, horizon_days: u32) -> Result<Vec<ForecastPoint>, ForecastError> {
        let mut out = Vec::with_capacity(horizon_days as usize);
        for step in 1..=i64::from(horizon_days) {
            let date = self.last_date + Duration::days(step);
            let x = (date - self.origin).num_days() as f64;
            let center = self.intercept + self.slope * x + self.seasonal_at(date);
            let half_width =
                self.z * self.sigma * (1.0 + step as f64 / self.n as f64).sqrt();

            let (estimate, lower, upper) = match self.mode {
                SeasonalityMode::Additive => (center, center - half_width, center + half_width),
                SeasonalityMode::Multiplicative => (
                    center.exp(),
                    (center - half_width).exp(),
                    (center + half_width).exp(),
                ),
            };

            if !(estimate.is_finite() && lower.is_finite() && upper.is_finite()) {
                return Err(ForecastError::Degenerate(format!(
                    "non-finite projection at {date}"
                )));
            }

            out.push(ForecastPoint {
                date,
                estimate,
                lower,
                upper,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy)]
enum Period {
    Weekly,
    Yearly,
}

impl Period {
    fn buckets(self) -> usize {
        match self {
            Period::Weekly => 7,
            Period::Yearly => 12,
        }
    }

    fn bucket(self, date: NaiveDate) -> usize {
        match self {
            Period::Weekly => date.weekday().num_days_from_monday() as usize,
            Period::Yearly => date.month0() as usize,
        }
    }
}

/// Weighted mean residual per bucket, centered on zero.
struct SeasonalProfile {
    period: Period,
    offsets: Vec<f64>,
}

impl SeasonalProfile {
    fn fit(series: &[Observation], residuals: &[f64], weights: &[f64], period: Period) -> Self {
        let mut sums = vec![0.0; period.buckets()];
        let mut mass = vec![0.0; period.buckets()];
        for ((o, r), w) in series.iter().zip(residuals).zip(weights) {
            let b = period.bucket(o.ts.date_naive());
            sums[b] += w * r;
            mass[b] += w;
        }

        let mut offsets: Vec<f64> = sums
            .iter()
            .zip(&mass)
            .map(|(s, m)| if *m > 0.0 { s / m } else { 0.0 })
            .collect();

        let populated: Vec<usize> = (0..offsets.len()).filter(|b| mass[*b] > 0.0).collect();
        if !populated.is_empty() {
            let mean = populated.iter().map(|b| offsets[*b]).sum::<f64>() / populated.len() as f64;
            for b in populated {
                offsets[b] -= mean;
            }
        }

        Self { period, offsets }
    }

    fn at(&self, date: NaiveDate) -> f64 {
        self.offsets[self.period.bucket(date)]
    }

    fn remove_from(&self, series: &[Observation], residuals: &mut [f64]) {
        for (o, r) in series.iter().zip(residuals.iter_mut()) {
            *r -= self.at(o.ts.date_naive());
        }
    }
}

fn weighted_least_squares(xs: &[f64], ys: &[f64], ws: &[f64]) -> Option<(f64, f64)> {
    let w_sum: f64 = ws.iter().sum();
    if w_sum <= 0.0 {
        return None;
    }
    let x_mean = xs.iter().zip(ws).map(|(x, w)| w * x).sum::<f64>() / w_sum;
    let y_mean = ys.iter().zip(ws).map(|(y, w)| w * y).sum::<f64>() / w_sum;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for ((x, y), w) in xs.iter().zip(ys).zip(ws) {
        sxx += w * (x - x_mean) * (x - x_mean);
        sxy += w * (x - x_mean) * (y - y_mean);
    }
    if sxx <= f64::EPSILON {
        return None;
    }

    let slope = sxy / sxx;
    Some((y_mean - slope * x_mean, slope))
}

/// Midnight-UTC observations, one per day starting at `start`.
#[cfg(test)]
pub(crate) fn daily_series(start: chrono::DateTime<chrono::Utc>, values: &[f64]) -> Vec<Observation> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| Observation {
            ts: start + Duration::days(i as i64),
            value: *v,
        })
        .collect()
}
