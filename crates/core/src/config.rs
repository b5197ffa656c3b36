use anyhow::Context;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::recommendation::Thresholds;
use crate::forecast::{Hyperparameters, SeasonalityMode};
use crate::messaging::retry::RetryPolicy;

/// Longest horizon accepted from any surface.
pub const MAX_FORECAST_DAYS: u32 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("unknown LOG_FORMAT: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    pub topic_stock_updates: String,
    pub topic_predictions: String,
    pub group_id: String,
    /// Upper bound on waiting for a broker ack when publishing.
    pub publish_timeout: Duration,
    /// Per-attempt bound on the cluster metadata fetch used to verify a
    /// connection.
    pub metadata_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ForecastSettings {
    pub horizon_days: u32,
    pub history_window_days: u32,
    pub price_interval: String,
    /// Minimum cleaned points required before a fit is attempted.
    pub min_history_points: usize,
    pub hyperparameters: Hyperparameters,
    pub thresholds: Thresholds,
    pub workers: usize,
    /// `None` disables the bound.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub cron: String,
    pub enabled: bool,
    pub precheck_window_days: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub concurrency: usize,
    pub queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub app_name: String,
    pub app_env: String,
    pub app_port: u16,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub sentry_dsn: Option<String>,
    pub log_format: LogFormat,
    pub kafka: KafkaSettings,
    pub retry: RetryPolicy,
    pub forecast: ForecastSettings,
    pub schedule: ScheduleSettings,
    pub dispatch: DispatchSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "stockcast".to_string(),
            app_env: "development".to_string(),
            app_port: 8086,
            database_url: None,
            database_max_connections: 5,
            sentry_dsn: None,
            log_format: LogFormat::Text,
            kafka: KafkaSettings {
                bootstrap_servers: "kafka:9092".to_string(),
                topic_stock_updates: "stock.updates".to_string(),
                topic_predictions: "predictions.recommendations".to_string(),
                group_id: "stockcast-consumer".to_string(),
                publish_timeout: Duration::from_secs(30),
                metadata_timeout: Duration::from_secs(10),
            },
            retry: RetryPolicy::default(),
            forecast: ForecastSettings {
                horizon_days: 30,
                history_window_days: 365,
                price_interval: "1day".to_string(),
                min_history_points: 30,
                hyperparameters: Hyperparameters::default(),
                thresholds: Thresholds::default(),
                workers: 2,
                timeout: Some(Duration::from_secs(120)),
            },
            schedule: ScheduleSettings {
                cron: "0 0 * * *".to_string(),
                enabled: true,
                precheck_window_days: 60,
            },
            dispatch: DispatchSettings {
                concurrency: 4,
                queue_depth: 256,
            },
        }
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup. Numeric values that do
    /// not parse fall back to their defaults; enum-like values must be valid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let d = Settings::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let num = |key: &str| get(key).and_then(|v| v.parse::<f64>().ok());
        let int = |key: &str| get(key).and_then(|v| v.parse::<u64>().ok());
        // Out-of-range values fall back like unparsable ones.
        let int32 = |key: &str| int(key).and_then(|v| u32::try_from(v).ok());
        let size = |key: &str| int(key).and_then(|v| usize::try_from(v).ok());
        let flag = |key: &str, default: bool| get(key).and_then(|v| parse_bool(&v)).unwrap_or(default);

        let hp = &d.forecast.hyperparameters;
        let seasonality_mode = match get("SEASONALITY_MODE") {
            Some(v) => v.parse::<SeasonalityMode>()?,
            None => hp.seasonality_mode,
        };
        let log_format = match get("LOG_FORMAT") {
            Some(v) => v.parse::<LogFormat>()?,
            None => d.log_format,
        };

        let t = &d.forecast.thresholds;
        let thresholds = Thresholds {
            strong_buy: num("STRONG_BUY_THRESHOLD").unwrap_or(t.strong_buy),
            buy: num("BUY_THRESHOLD").unwrap_or(t.buy),
            hold: num("HOLD_THRESHOLD").unwrap_or(t.hold),
            sell: num("SELL_THRESHOLD").unwrap_or(t.sell),
            strong_sell: num("STRONG_SELL_THRESHOLD").unwrap_or(t.strong_sell),
        };

        let timeout = match int("FORECAST_TIMEOUT_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => d.forecast.timeout,
        };

        Ok(Self {
            app_name: get("APP_NAME").unwrap_or(d.app_name),
            app_env: get("APP_ENV").unwrap_or(d.app_env),
            app_port: get("APP_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.app_port),
            database_url: get("DATABASE_URL"),
            database_max_connections: int32("DATABASE_MAX_CONNECTIONS")
                .unwrap_or(d.database_max_connections),
            sentry_dsn: get("SENTRY_DSN"),
            log_format,
            kafka: KafkaSettings {
                bootstrap_servers: get("KAFKA_BOOTSTRAP_SERVERS").unwrap_or(d.kafka.bootstrap_servers),
                topic_stock_updates: get("KAFKA_TOPIC_STOCK_UPDATES")
                    .unwrap_or(d.kafka.topic_stock_updates),
                topic_predictions: get("KAFKA_TOPIC_PREDICTIONS").unwrap_or(d.kafka.topic_predictions),
                group_id: get("KAFKA_GROUP_ID").unwrap_or(d.kafka.group_id),
                publish_timeout: int("KAFKA_PUBLISH_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(d.kafka.publish_timeout),
                metadata_timeout: int("KAFKA_METADATA_TIMEOUT_SECS")
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs)
                    .unwrap_or(d.kafka.metadata_timeout),
            },
            retry: RetryPolicy {
                max_attempts: int32("BROKER_MAX_RETRIES")
                    .unwrap_or(d.retry.max_attempts),
                delay: int("BROKER_RETRY_DELAY_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(d.retry.delay),
            },
            forecast: ForecastSettings {
                horizon_days: int32("FORECAST_DAYS")
                    .unwrap_or(d.forecast.horizon_days),
                history_window_days: int32("HISTORY_WINDOW_DAYS")
                    .unwrap_or(d.forecast.history_window_days),
                price_interval: get("HISTORICAL_PRICE_INTERVAL").unwrap_or(d.forecast.price_interval),
                min_history_points: size("MIN_HISTORICAL_DAYS")
                    .unwrap_or(d.forecast.min_history_points),
                hyperparameters: Hyperparameters {
                    changepoint_prior_scale: num("CHANGEPOINT_PRIOR_SCALE")
                        .unwrap_or(hp.changepoint_prior_scale),
                    seasonality_mode,
                    interval_width: num("INTERVAL_WIDTH").unwrap_or(hp.interval_width),
                    daily_seasonality: flag("DAILY_SEASONALITY", hp.daily_seasonality),
                    weekly_seasonality: flag("WEEKLY_SEASONALITY", hp.weekly_seasonality),
                    yearly_seasonality: flag("YEARLY_SEASONALITY", hp.yearly_seasonality),
                },
                thresholds,
                workers: size("FORECAST_WORKERS")
                    .unwrap_or(d.forecast.workers),
                timeout,
            },
            schedule: ScheduleSettings {
                cron: get("PREDICTION_CRON_SCHEDULE").unwrap_or(d.schedule.cron),
                enabled: flag("AUTO_PREDICTION_ENABLED", d.schedule.enabled),
                precheck_window_days: int32("PRECHECK_WINDOW_DAYS")
                    .unwrap_or(d.schedule.precheck_window_days),
            },
            dispatch: DispatchSettings {
                concurrency: size("DISPATCH_CONCURRENCY")
                    .unwrap_or(d.dispatch.concurrency),
                queue_depth: size("DISPATCH_QUEUE_DEPTH")
                    .unwrap_or(d.dispatch.queue_depth),
            },
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.forecast
            .thresholds
            .validate()
            .context("invalid recommendation thresholds")?;
        self.forecast
            .hyperparameters
            .validate()
            .context("invalid forecast hyperparameters")?;
        validate_horizon(self.forecast.horizon_days).context("invalid FORECAST_DAYS")?;
        anyhow::ensure!(
            self.forecast.min_history_points >= 2,
            "MIN_HISTORICAL_DAYS must be >= 2"
        );
        anyhow::ensure!(
            self.forecast.history_window_days >= 1,
            "HISTORY_WINDOW_DAYS must be >= 1"
        );
        anyhow::ensure!(self.forecast.workers >= 1, "FORECAST_WORKERS must be >= 1");
        anyhow::ensure!(self.retry.max_attempts >= 1, "BROKER_MAX_RETRIES must be >= 1");
        anyhow::ensure!(
            self.schedule.precheck_window_days >= 1,
            "PRECHECK_WINDOW_DAYS must be >= 1"
        );
        anyhow::ensure!(self.dispatch.concurrency >= 1, "DISPATCH_CONCURRENCY must be >= 1");
        anyhow::ensure!(self.dispatch.queue_depth >= 1, "DISPATCH_QUEUE_DEPTH must be >= 1");
        crate::scheduler::parse_schedule(&self.schedule.cron)
            .context("invalid PREDICTION_CRON_SCHEDULE")?;
        Ok(())
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is required")
    }
}

pub fn validate_horizon(days: u32) -> anyhow::Result<()> {
    anyhow::ensure!(
        (1..=MAX_FORECAST_DAYS).contains(&days),
        "forecast horizon must be within 1..={MAX_FORECAST_DAYS} days (got {days})"
    );
    Ok(())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> anyhow::Result<Settings> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        let s = settings_from(&[]).unwrap();
        s.validate().unwrap();
        assert_eq!(s.app_port, 8086);
        assert_eq!(s.retry, RetryPolicy::default());
        assert_eq!(s.forecast.horizon_days, 30);
        assert_eq!(s.forecast.min_history_points, 30);
        assert_eq!(s.forecast.timeout, Some(Duration::from_secs(120)));
        assert_eq!(s.schedule.cron, "0 0 * * *");
        assert!(s.require_database_url().is_err());
    }

    #[test]
    fn reads_overrides() {
        let s = settings_from(&[
            ("DATABASE_URL", "postgres://localhost/stockcast"),
            ("FORECAST_DAYS", "14"),
            ("SEASONALITY_MODE", "additive"),
            ("WEEKLY_SEASONALITY", "false"),
            ("BUY_THRESHOLD", "4.5"),
            ("BROKER_MAX_RETRIES", "3"),
            ("FORECAST_TIMEOUT_SECS", "0"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        s.validate().unwrap();
        assert_eq!(s.require_database_url().unwrap(), "postgres://localhost/stockcast");
        assert_eq!(s.forecast.horizon_days, 14);
        assert_eq!(
            s.forecast.hyperparameters.seasonality_mode,
            SeasonalityMode::Additive
        );
        assert!(!s.forecast.hyperparameters.weekly_seasonality);
        assert_eq!(s.forecast.thresholds.buy, 4.5);
        assert_eq!(s.retry.max_attempts, 3);
        assert_eq!(s.forecast.timeout, None);
        assert_eq!(s.log_format, LogFormat::Json);
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let s = settings_from(&[("APP_PORT", "eighty"), ("INTERVAL_WIDTH", "wide")]).unwrap();
        assert_eq!(s.app_port, 8086);
        assert_eq!(s.forecast.hyperparameters.interval_width, 0.95);
    }

    #[test]
    fn oversized_numbers_fall_back_instead_of_wrapping() {
        let s = settings_from(&[
            ("FORECAST_DAYS", "4294967301"),
            ("BROKER_MAX_RETRIES", "4294967297"),
            ("PRECHECK_WINDOW_DAYS", "18446744073709551616"),
        ])
        .unwrap();
        assert_eq!(s.forecast.horizon_days, 30);
        assert_eq!(s.retry.max_attempts, 10);
        assert_eq!(s.schedule.precheck_window_days, 60);
        s.validate().unwrap();
    }

    #[test]
    fn unknown_enum_values_are_errors() {
        assert!(settings_from(&[("SEASONALITY_MODE", "logistic")]).is_err());
        assert!(settings_from(&[("LOG_FORMAT", "xml")]).is_err());
    }

    #[test]
    fn rejects_inconsistent_values() {
        let s = settings_from(&[("BUY_THRESHOLD", "12")]).unwrap();
        assert!(s.validate().is_err());

        let s = settings_from(&[("PREDICTION_CRON_SCHEDULE", "every day")]).unwrap();
        assert!(s.validate().is_err());

        let s = settings_from(&[("FORECAST_DAYS", "400")]).unwrap();
        assert!(s.validate().is_err());
    }
}
