use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockcast_core::config::{LogFormat, Settings};
use stockcast_core::forecast::trend::TrendForecaster;
use stockcast_core::forecast::Forecaster;
use stockcast_core::messaging::dispatcher::Dispatcher;
use stockcast_core::messaging::kafka::{spawn_consumer, KafkaPublisher};
use stockcast_core::messaging::Publisher;
use stockcast_core::pipeline::ForecastPipeline;
use stockcast_core::scheduler::Scheduler;
use stockcast_core::storage::postgres::PgStore;
use stockcast_core::storage::Store;

mod routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);
    init_tracing(settings.log_format);

    if let Err(e) = run(settings).await {
        sentry_anyhow::capture_anyhow(&e);
        tracing::error!(error = ?e, "service stopped on a fatal error");
        return Err(e);
    }
    Ok(())
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    settings.validate()?;
    let settings = Arc::new(settings);

    // Without a store nothing can be computed or served: fatal.
    let db_url = settings.require_database_url()?;
    let pg = PgStore::connect(db_url, settings.database_max_connections, settings.retry)
        .await
        .context("database unavailable at startup")?;
    pg.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(pg);

    // Without a producer results could never be republished: fatal.
    let producer = Arc::new(
        KafkaPublisher::connect(&settings.kafka, settings.retry)
            .await
            .context("kafka producer unavailable at startup")?,
    );
    let publisher: Arc<dyn Publisher> = producer.clone();

    let forecaster: Arc<dyn Forecaster> = Arc::new(TrendForecaster);
    let pipeline = Arc::new(ForecastPipeline::new(
        store,
        forecaster,
        settings.forecast.clone(),
    ));

    let (dispatcher, dispatch_task) =
        Dispatcher::start(pipeline.clone(), publisher.clone(), settings.dispatch);
    // Retries in the background; the API comes up regardless.
    let consumer = spawn_consumer(settings.kafka.clone(), settings.retry, dispatcher);

    let scheduler = Arc::new(Scheduler::new(
        pipeline.clone(),
        publisher.clone(),
        settings.schedule.clone(),
    ));
    let cron = scheduler.spawn_cron()?;

    let app = routes::router(routes::AppState {
        settings: settings.clone(),
        pipeline: pipeline.clone(),
        scheduler,
        publisher,
        consumer_status: consumer.status_receiver(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.app_port));
    tracing::info!(
        %addr,
        env = %settings.app_env,
        forecaster = pipeline.forecaster_name(),
        "api listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(cron) = cron {
        cron.stop().await;
    }
    consumer.shutdown().await;
    if let Err(e) = dispatch_task.await {
        tracing::warn!(error = %e, "dispatcher ended abnormally");
    }
    if let Err(e) = producer.flush().await {
        tracing::warn!(error = %e, "kafka producer flush failed");
    }
    tracing::info!("shutdown complete");
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

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(settings.app_env.clone().into()),
            ..Default::default()
        },
    )))
}
