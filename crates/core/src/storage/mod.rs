//! Persistence gateway: read access to the historical-price store and
//! idempotent read/write access to recommendations.

pub mod memory;
pub mod postgres;

use chrono::NaiveDate;

use crate::domain::forecast::PricePoint;
use crate::domain::recommendation::Recommendation;

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn ping(&self) -> anyhow::Result<()>;

    /// Points from (now - `days`) to now, ascending by timestamp.
    async fn historical_prices(
        &self,
        symbol: &str,
        days: u32,
        interval: &str,
    ) -> anyhow::Result<Vec<PricePoint>>;

    /// Atomic insert-or-update keyed by (symbol, period). `created_at` is
    /// only taken from `rec` on insert; the stored row is returned.
    async fn upsert_recommendation(&self, rec: &Recommendation) -> anyhow::Result<Recommendation>;

    /// Most recent recommendation for `symbol`, or the one for exactly
    /// `period` when given.
    async fn latest_recommendation(
        &self,
        symbol: &str,
        period: Option<NaiveDate>,
    ) -> anyhow::Result<Option<Recommendation>>;

    /// Distinct symbols present in the historical-price store, sorted.
    async fn list_symbols(&self) -> anyhow::Result<Vec<String>>;
}
