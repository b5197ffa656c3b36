use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use stockcast_core::config::{validate_horizon, Settings};
use stockcast_core::domain::contract::normalize_symbol;
use stockcast_core::domain::forecast::ForecastResult;
use stockcast_core::domain::recommendation::Recommendation;
use stockcast_core::error::PipelineError;
use stockcast_core::messaging::{ConsumerStatus, Publisher};
use stockcast_core::pipeline::ForecastPipeline;
use stockcast_core::scheduler::Scheduler;

/// Symbols whose row counts are reported by `/api/symbols`.
const SAMPLE_SYMBOLS: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pipeline: Arc<ForecastPipeline>,
    pub scheduler: Arc<Scheduler>,
    pub publisher: Arc<dyn Publisher>,
    pub consumer_status: watch::Receiver<ConsumerStatus>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/predict", post(predict))
        .route("/api/predict/batch", post(predict_batch))
        .route("/api/recommendation/generate", post(generate_recommendation))
        .route("/api/recommendation/:symbol", get(get_recommendation))
        .route("/api/symbols", get(list_symbols))
        .route("/api/admin/run-predictions", post(run_predictions))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
struct ServiceInfo {
    service: String,
    version: &'static str,
    status: &'static str,
    timestamp: DateTime<Utc>,
}

async fn root(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: state.settings.app_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Serialize)]
struct Dependencies {
    database: &'static str,
    kafka_producer: &'static str,
    kafka_consumer: ConsumerStatus,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    version: &'static str,
    dependencies: Dependencies,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match state.pipeline.store().ping().await {
        Ok(()) => "healthy",
        Err(e) => {
            tracing::warn!(error = %e, "health check: database unreachable");
            "unhealthy"
        }
    };
    let consumer = *state.consumer_status.borrow();
    // The service never runs without a producer; its presence is its health.
    let kafka_producer = "healthy";

    let status = if database == "healthy" && consumer == ConsumerStatus::Running {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        service: state.settings.app_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        dependencies: Dependencies {
            database,
            kafka_producer,
            kafka_consumer: consumer,
        },
    })
}

#[derive(Debug, Deserialize)]
struct PredictRequest {
    symbol: String,
    #[serde(default)]
    forecast_days: Option<u32>,
}

impl PredictRequest {
    fn validated(&self) -> Result<(String, Option<u32>), StatusCode> {
        let symbol = normalize_symbol(&self.symbol).map_err(|_| StatusCode::BAD_REQUEST)?;
        validated_horizon(self.forecast_days)?;
        Ok((symbol, self.forecast_days))
    }
}

fn validated_horizon(days: Option<u32>) -> Result<(), StatusCode> {
    match days {
        Some(d) => validate_horizon(d).map_err(|_| StatusCode::BAD_REQUEST),
        None => Ok(()),
    }
}

async fn predict(
    State(state): State<AppState>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<ForecastResult>, StatusCode> {
    let (symbol, horizon) = req.validated()?;
    let result = state
        .pipeline
        .try_predict(&symbol, horizon)
        .await
        .map_err(|e| pipeline_status(&symbol, e))?;
    Ok(Json(result))
}

/// Too little history is "not found"; every other pipeline failure is ours.
fn pipeline_status(symbol: &str, err: PipelineError) -> StatusCode {
    if err.is_soft() {
        tracing::info!(%symbol, error = %err, "no forecast for symbol");
        return StatusCode::NOT_FOUND;
    }
    let kind = err.kind();
    let err = anyhow::Error::new(err);
    sentry_anyhow::capture_anyhow(&err);
    tracing::error!(%symbol, kind, error = %err, "forecast request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    symbols: Vec<String>,
    #[serde(default)]
    forecast_days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct BatchAccepted {
    message: String,
    symbols: Vec<String>,
    status: &'static str,
}

async fn predict_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchAccepted>), StatusCode> {
    if req.symbols.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    validated_horizon(req.forecast_days)?;
    let symbols = req
        .symbols
        .iter()
        .map(|s| normalize_symbol(s))
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let scheduler = Arc::clone(&state.scheduler);
    let work = symbols.clone();
    let horizon = req.forecast_days;
    tokio::spawn(async move {
        scheduler.run_symbols(&work, horizon).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(BatchAccepted {
            message: format!("Batch prediction started for {} symbols", symbols.len()),
            symbols,
            status: "processing",
        }),
    ))
}

async fn generate_recommendation(
    State(state): State<AppState>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<Recommendation>, StatusCode> {
    let (symbol, horizon) = req.validated()?;
    let rec = state
        .pipeline
        .try_generate_recommendation(&symbol, horizon)
        .await
        .map_err(|e| pipeline_status(&symbol, e))?;
    state.publisher.publish(&rec).await;
    Ok(Json(rec))
}

#[derive(Debug, Deserialize)]
struct PeriodQuery {
    period: Option<String>,
}

async fn get_recommendation(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<Recommendation>, StatusCode> {
    let symbol = normalize_symbol(&symbol).map_err(|_| StatusCode::BAD_REQUEST)?;
    let period = match query.period.as_deref() {
        Some(p) => Some(
            NaiveDate::parse_from_str(p, "%Y-%m-%d").map_err(|_| StatusCode::BAD_REQUEST)?,
        ),
        None => None,
    };

    let rec = state
        .pipeline
        .store()
        .latest_recommendation(&symbol, period)
        .await
        .map_err(|e| {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(%symbol, error = %e, "recommendation lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(rec))
}

#[derive(Debug, Serialize)]
struct SymbolsResponse {
    symbols: Vec<String>,
    count: usize,
    sample_data_counts: BTreeMap<String, usize>,
    note: String,
}

async fn list_symbols(State(state): State<AppState>) -> Result<Json<SymbolsResponse>, StatusCode> {
    let store = state.pipeline.store();
    let forecast = &state.settings.forecast;
    let internal = |e: anyhow::Error| {
        sentry_anyhow::capture_anyhow(&e);
        tracing::error!(error = %e, "symbol listing failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    let symbols = store.list_symbols().await.map_err(internal)?;
    let mut sample_data_counts = BTreeMap::new();
    for symbol in symbols.iter().take(SAMPLE_SYMBOLS) {
        let rows = store
            .historical_prices(symbol, forecast.history_window_days, &forecast.price_interval)
            .await
            .map_err(internal)?;
        sample_data_counts.insert(symbol.clone(), rows.len());
    }

    Ok(Json(SymbolsResponse {
        count: symbols.len(),
        symbols,
        sample_data_counts,
        note: format!(
            "Minimum {} days of historical data required for predictions",
            forecast.min_history_points
        ),
    }))
}

#[derive(Debug, Serialize)]
struct TriggerAccepted {
    message: &'static str,
    status: &'static str,
}

async fn run_predictions(State(state): State<AppState>) -> (StatusCode, Json<TriggerAccepted>) {
    let _ = state.scheduler.trigger();
    (
        StatusCode::ACCEPTED,
        Json(TriggerAccepted {
            message: "Prediction job triggered",
            status: "processing",
        }),
    )
}
