use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::forecast::PricePoint;
use crate::domain::recommendation::{AnalystCounts, Recommendation, RecommendationMetadata};
use crate::messaging::retry::{connect_with_retry, RetryPolicy};
use crate::storage::Store;

type RecommendationRow = (
    Uuid,
    String,
    NaiveDate,
    i32,
    i32,
    i32,
    i32,
    i32,
    Json<RecommendationMetadata>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const RECOMMENDATION_COLUMNS: &str =
    "id, symbol, period, strong_buy, buy, hold, sell, strong_sell, metadata, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects with the shared startup retry budget. Running out of
    /// attempts is an error the caller is expected to treat as fatal.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        policy: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let pool = connect_with_retry(policy, "postgres", |_| async move {
            PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(database_url)
                .await
                .context("connect DATABASE_URL failed")
        })
        .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("sqlx migrations failed")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn into_recommendation(row: RecommendationRow) -> Recommendation {
    let (id, symbol, period, strong_buy, buy, hold, sell, strong_sell, metadata, created_at, updated_at) =
        row;
    Recommendation {
        id: Some(id),
        symbol,
        period,
        counts: AnalystCounts {
            strong_buy,
            buy,
            hold,
            sell,
            strong_sell,
        },
        metadata: metadata.0,
        created_at,
        updated_at,
    }
}

#[async_trait::async_trait]
impl Store for PgStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }

    async fn historical_prices(
        &self,
        symbol: &str,
        days: u32,
        interval: &str,
    ) -> anyhow::Result<Vec<PricePoint>> {
        let now = Utc::now();
        let since = now - chrono::Duration::days(i64::from(days));

        let rows = sqlx::query_as::<_, (DateTime<Utc>, Option<String>)>(
            "SELECT ts, close \
             FROM historical_prices \
             WHERE symbol = $1 AND bar_interval = $2 AND ts >= $3 AND ts <= $4 \
             ORDER BY ts ASC",
        )
        .bind(symbol)
        .bind(interval)
        .bind(since)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("select historical_prices failed for {symbol}"))?;

        Ok(rows
            .into_iter()
            .map(|(ts, close)| PricePoint { ts, close })
            .collect())
    }

    async fn upsert_recommendation(&self, rec: &Recommendation) -> anyhow::Result<Recommendation> {
        rec.counts.validate()?;
        let id = rec.id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();

        // One statement: the unique (symbol, period) key arbitrates
        // concurrent writers and created_at is never part of the update.
        let sql = format!(
            "INSERT INTO recommendations ({RECOMMENDATION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (symbol, period) DO UPDATE \
               SET strong_buy = EXCLUDED.strong_buy, buy = EXCLUDED.buy, hold = EXCLUDED.hold, \
                   sell = EXCLUDED.sell, strong_sell = EXCLUDED.strong_sell, \
                   metadata = EXCLUDED.metadata, updated_at = EXCLUDED.updated_at \
             RETURNING {RECOMMENDATION_COLUMNS}"
        );

        let row = sqlx::query_as::<_, RecommendationRow>(&sql)
            .bind(id)
            .bind(&rec.symbol)
            .bind(rec.period)
            .bind(rec.counts.strong_buy)
            .bind(rec.counts.buy)
            .bind(rec.counts.hold)
            .bind(rec.counts.sell)
            .bind(rec.counts.strong_sell)
            .bind(Json(rec.metadata))
            .bind(rec.created_at)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .with_context(|| {
                format!(
                    "upsert recommendations failed for {} {}",
                    rec.symbol, rec.period
                )
            })?;

        Ok(into_recommendation(row))
    }

    async fn latest_recommendation(
        &self,
        symbol: &str,
        period: Option<NaiveDate>,
    ) -> anyhow::Result<Option<Recommendation>> {
        let row = match period {
            Some(p) => {
                let sql = format!(
                    "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations \
                     WHERE symbol = $1 AND period = $2 \
                     LIMIT 1"
                );
                sqlx::query_as::<_, RecommendationRow>(&sql)
                    .bind(symbol)
                    .bind(p)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations \
                     WHERE symbol = $1 \
                     ORDER BY period DESC, updated_at DESC \
                     LIMIT 1"
                );
                sqlx::query_as::<_, RecommendationRow>(&sql)
                    .bind(symbol)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        Ok(row.map(into_recommendation))
    }

    async fn list_symbols(&self) -> anyhow::Result<Vec<String>> {
        let symbols = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT symbol FROM historical_prices ORDER BY symbol",
        )
        .fetch_all(&self.pool)
        .await
        .context("select distinct symbols failed")?;
        Ok(symbols)
    }
}
