//! Bulk prediction run over every known symbol, fired by cron or by hand.
//!
//! There is no run lock: a manual trigger and a cron firing may overlap and
//! race on the same (symbol, period) rows, with the last write winning.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ScheduleSettings;
use crate::messaging::Publisher;
use crate::pipeline::ForecastPipeline;

/// Accepts standard 5-field crontab (minute first) as well as the 6/7-field
/// form with seconds.
pub fn parse_schedule(expr: &str) -> anyhow::Result<cron::Schedule> {
    let trimmed = expr.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_string(),
        n => anyhow::bail!("cron expression needs 5, 6 or 7 fields (got {n}): {trimmed:?}"),
    };
    cron::Schedule::from_str(&normalized)
        .with_context(|| format!("invalid cron expression: {trimmed:?}"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct Scheduler {
    pipeline: Arc<ForecastPipeline>,
    publisher: Arc<dyn Publisher>,
    settings: ScheduleSettings,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<ForecastPipeline>,
        publisher: Arc<dyn Publisher>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            pipeline,
            publisher,
            settings,
        }
    }

    /// One pass over every symbol in the price store.
    pub async fn run_batch(&self) -> anyhow::Result<BatchReport> {
        let symbols = self
            .pipeline
            .store()
            .list_symbols()
            .await
            .context("list symbols failed")?;
        if symbols.is_empty() {
            tracing::info!("no symbols in the price store yet; nothing to predict");
            return Ok(BatchReport::default());
        }
        tracing::info!(symbols = symbols.len(), "prediction batch starting");
        Ok(self.run_symbols(&symbols, None).await)
    }

    /// Sequential on purpose: one fit at a time bounds the batch's CPU use.
    /// A symbol's failure is counted and the loop moves on.
    pub async fn run_symbols(&self, symbols: &[String], horizon_days: Option<u32>) -> BatchReport {
        let min_rows = self.pipeline.settings().min_history_points;
        let window = self.settings.precheck_window_days;
        let mut report = BatchReport {
            total: symbols.len(),
            ..BatchReport::default()
        };

        for symbol in symbols {
            match self.pipeline.recent_rows(symbol, window).await {
                Ok(rows) if rows < min_rows => {
                    tracing::debug!(%symbol, rows, min_rows, "skipping symbol with insufficient data");
                    report.skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(%symbol, error = %e, "precheck failed");
                    report.failed += 1;
                    continue;
                }
            }

            match self.pipeline.generate_recommendation(symbol, horizon_days).await {
                Some(rec) => {
                    report.succeeded += 1;
                    self.publisher.publish(&rec).await;
                }
                None => report.failed += 1,
            }
        }

        tracing::info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "prediction batch finished"
        );
        report
    }

    /// `run_batch` with its error logged instead of returned.
    pub async fn run_scheduled(&self) -> Option<BatchReport> {
        match self.run_batch().await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = ?e, "prediction batch failed");
                None
            }
        }
    }

    /// Manual trigger: runs the batch in the background and returns at once.
    pub fn trigger(self: &Arc<Self>) -> JoinHandle<Option<BatchReport>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_scheduled().await })
    }

    /// Starts the cron loop, or returns `None` when automatic runs are off.
    pub fn spawn_cron(self: &Arc<Self>) -> anyhow::Result<Option<CronHandle>> {
        if !self.settings.enabled {
            tracing::info!("automatic predictions disabled");
            return Ok(None);
        }
        let schedule = parse_schedule(&self.settings.cron)?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let expr = self.settings.cron.clone();

        let task = tokio::spawn(async move {
            tracing::info!(cron = %expr, "prediction schedule armed");
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    tracing::warn!(cron = %expr, "cron schedule has no upcoming firing");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tracing::debug!(%next, "next scheduled prediction batch");

                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = this.run_scheduled() => {}
                }
            }
            tracing::info!("prediction schedule stopped");
        });

        Ok(Some(CronHandle {
            shutdown: shutdown_tx,
            task,
        }))
    }
}

pub struct CronHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CronHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::domain::forecast::PricePoint;
    use crate::messaging::RecordingPublisher;
    use crate::pipeline::testing::{pipeline, seed, FixedChange};
    use crate::storage::memory::MemoryStore;
    use chrono::{Timelike, TimeZone};

    fn scheduler(store: Arc<MemoryStore>, publisher: Arc<RecordingPublisher>) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            Arc::new(pipeline(store, FixedChange(7.5))),
            publisher,
            Settings::default().schedule,
        ))
    }

    #[test]
    fn five_field_crontab_fires_at_midnight() {
        let schedule = parse_schedule("0 0 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 5, 1, 13, 45, 0).unwrap();
        let next = schedule.after(&after).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 5, 2, 0, 0, 0).unwrap());
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn rejects_malformed_cron() {
        assert!(parse_schedule("daily").is_err());
        assert!(parse_schedule("0 0 0 * * * * *").is_err());
        assert!(parse_schedule("0 30 6 * * *").is_ok());
    }

    #[tokio::test]
    async fn batch_counts_skips_successes_and_failures() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "SHORT", 10, "20").await;
        seed(&store, "GOOD", 40, "100").await;
        seed(&store, "JUNK", 40, "n/a").await;
        let publisher = Arc::new(RecordingPublisher::new());

        let report = scheduler(store.clone(), publisher.clone()).run_batch().await.unwrap();

        assert_eq!(
            report,
            BatchReport {
                total: 3,
                succeeded: 1,
                failed: 1,
                skipped: 1,
            }
        );
        let published = publisher.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].symbol, "GOOD");
        assert_eq!(store.recommendations().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_store_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let report = scheduler(store, publisher).run_batch().await.unwrap();
        assert_eq!(report, BatchReport::default());
    }

    #[tokio::test]
    async fn manual_trigger_runs_in_background() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "GOOD", 40, "100").await;
        let now = Utc::now();
        store
            .insert_prices("STALE", "1day", [PricePoint::new(now - chrono::Duration::days(3), "1")])
            .await;
        let publisher = Arc::new(RecordingPublisher::new());

        let report = scheduler(store, publisher.clone()).trigger().await.unwrap().unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(publisher.published().await.len(), 1);
    }

    #[tokio::test]
    async fn cron_loop_stops_on_request() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let handle = scheduler(store, publisher).spawn_cron().unwrap().unwrap();
        handle.stop().await;
    }

    #[tokio::test]
    async fn disabled_schedule_spawns_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut settings = Settings::default().schedule;
        settings.enabled = false;
        let s = Arc::new(Scheduler::new(
            Arc::new(pipeline(store, FixedChange(1.0))),
            Arc::new(RecordingPublisher::new()),
            settings,
        ));
        assert!(s.spawn_cron().unwrap().is_none());
    }
}
