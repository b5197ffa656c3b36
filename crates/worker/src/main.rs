use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockcast_core::config::{validate_horizon, LogFormat, Settings};
use stockcast_core::domain::contract::normalize_symbol;
use stockcast_core::forecast::trend::TrendForecaster;
use stockcast_core::messaging::kafka::KafkaPublisher;
use stockcast_core::messaging::Publisher;
use stockcast_core::pipeline::ForecastPipeline;
use stockcast_core::scheduler::Scheduler;
use stockcast_core::storage::postgres::PgStore;
use stockcast_core::storage::Store;

#[derive(Debug, Parser)]
#[command(name = "stockcast_worker")]
struct Args {
    /// Comma-separated symbols. Defaults to every symbol in the price store.
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Forecast horizon in days. Defaults to FORECAST_DAYS.
    #[arg(long)]
    forecast_days: Option<u32>,

    /// Forecast and log only: nothing is stored or published.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);
    init_tracing(settings.log_format);

    let args = Args::parse();

    if let Err(e) = run(settings, args).await {
        sentry_anyhow::capture_anyhow(&e);
        tracing::error!(error = ?e, "prediction run failed");
        return Err(e);
    }
    Ok(())
}

async fn run(settings: Settings, args: Args) -> anyhow::Result<()> {
    settings.validate()?;
    if let Some(days) = args.forecast_days {
        validate_horizon(days)?;
    }
    let symbols = args
        .symbols
        .iter()
        .map(|s| normalize_symbol(s))
        .collect::<anyhow::Result<Vec<_>>>()
        .context("invalid --symbols")?;

    let db_url = settings.require_database_url()?;
    let pg = PgStore::connect(db_url, settings.database_max_connections, settings.retry).await?;
    pg.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(pg);

    let pipeline = Arc::new(ForecastPipeline::new(
        store.clone(),
        Arc::new(TrendForecaster),
        settings.forecast.clone(),
    ));

    if args.dry_run {
        let symbols = if symbols.is_empty() {
            store.list_symbols().await?
        } else {
            symbols
        };
        let mut produced = 0usize;
        for symbol in &symbols {
            if let Some(result) = pipeline.predict(symbol, args.forecast_days).await {
                produced += 1;
                tracing::info!(
                    %symbol,
                    dry_run = true,
                    label = %result.recommendation,
                    change_percent = result.change_percent,
                    prediction_date = %result.prediction_date,
                    "forecast"
                );
            }
        }
        tracing::info!(dry_run = true, total = symbols.len(), produced, "dry run finished");
        return Ok(());
    }

    let producer = Arc::new(KafkaPublisher::connect(&settings.kafka, settings.retry).await?);
    let publisher: Arc<dyn Publisher> = producer.clone();
    let scheduler = Scheduler::new(pipeline, publisher, settings.schedule.clone());

    let report = if symbols.is_empty() {
        scheduler.run_batch().await?
    } else {
        scheduler.run_symbols(&symbols, args.forecast_days).await
    };

    if let Err(e) = producer.flush().await {
        tracing::warn!(error = %e, "kafka producer flush failed");
    }

    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(sentry_tracing::layer());
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_symbol_list_and_flags() {
        let args = Args::parse_from([
            "stockcast_worker",
            "--symbols",
            "AAPL,MSFT",
            "--forecast-days",
            "14",
            "--dry-run",
        ]);
        assert_eq!(args.symbols, ["AAPL", "MSFT"]);
        assert_eq!(args.forecast_days, Some(14));
        assert!(args.dry_run);
    }

    #[test]
    fn defaults_to_every_symbol() {
        let args = Args::parse_from(["stockcast_worker"]);
        assert!(args.symbols.is_empty());
        assert_eq!(args.forecast_days, None);
        assert!(!args.dry_run);
    }
}
