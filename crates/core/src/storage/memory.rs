use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::forecast::PricePoint;
use crate::domain::recommendation::Recommendation;
use crate::storage::Store;

/// In-process store for tests and local runs without Postgres. Behaves like
/// [`super::postgres::PgStore`] with respect to the (symbol, period) key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

#[derive(Debug, Default)]
struct Inner {
    /// (symbol, interval) -> points keyed by timestamp.
    prices: BTreeMap<(String, String), BTreeMap<chrono::DateTime<Utc>, PricePoint>>,
    /// (symbol, period) -> stored row.
    recommendations: BTreeMap<(String, NaiveDate), Recommendation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_prices(
        &self,
        symbol: &str,
        interval: &str,
        points: impl IntoIterator<Item = PricePoint>,
    ) {
        let mut inner = self.inner.lock().await;
        let series = inner
            .prices
            .entry((symbol.to_string(), interval.to_string()))
            .or_default();
        for p in points {
            series.insert(p.ts, p);
        }
    }

    /// Makes every subsequent upsert fail, to exercise persistence errors.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn recommendations(&self) -> Vec<Recommendation> {
        let inner = self.inner.lock().await;
        inner.recommendations.values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> anyhow::Result<()> {
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
        let inner = self.inner.lock().await;
        let Some(series) = inner.prices.get(&(symbol.to_string(), interval.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(series.range(since..=now).map(|(_, p)| p.clone()).collect())
    }

    async fn upsert_recommendation(&self, rec: &Recommendation) -> anyhow::Result<Recommendation> {
        anyhow::ensure!(
            !self.fail_writes.load(Ordering::SeqCst),
            "memory store is rejecting writes"
        );
        rec.counts.validate()?;

        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let key = (rec.symbol.clone(), rec.period);

        let stored = match inner.recommendations.get(&key) {
            Some(existing) => Recommendation {
                id: existing.id,
                created_at: existing.created_at,
                updated_at: now,
                ..rec.clone()
            },
            None => Recommendation {
                id: Some(rec.id.unwrap_or_else(Uuid::new_v4)),
                updated_at: now,
                ..rec.clone()
            },
        };
        inner.recommendations.insert(key, stored.clone());
        Ok(stored)
    }

    async fn latest_recommendation(
        &self,
        symbol: &str,
        period: Option<NaiveDate>,
    ) -> anyhow::Result<Option<Recommendation>> {
        let inner = self.inner.lock().await;
        let found = match period {
            Some(p) => inner.recommendations.get(&(symbol.to_string(), p)).cloned(),
            None => inner
                .recommendations
                .values()
                .filter(|r| r.symbol == symbol)
                .max_by_key(|r| (r.period, r.updated_at))
                .cloned(),
        };
        Ok(found)
    }

    async fn list_symbols(&self) -> anyhow::Result<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut symbols: Vec<String> = inner.prices.keys().map(|(s, _)| s.clone()).collect();
        symbols.dedup();
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recommendation::{AnalystCounts, RecommendationLabel, RecommendationMetadata};
    use chrono::{Duration, TimeZone};

    fn rec(symbol: &str, period: NaiveDate, change: f64) -> Recommendation {
        let created = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        Recommendation {
            id: None,
            symbol: symbol.to_string(),
            period,
            counts: AnalystCounts::synthesize(RecommendationLabel::Buy, change),
            metadata: RecommendationMetadata {
                predicted_price: 105.0,
                current_price: 100.0,
                change_percent: change,
                confidence_lower: 98.0,
                confidence_upper: 112.0,
            },
            created_at: created,
            updated_at: created,
        }
    }

    #[tokio::test]
    async fn second_upsert_keeps_created_at_and_overwrites_counts() {
        let store = MemoryStore::new();
        let period = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();

        let first = store.upsert_recommendation(&rec("AAPL", period, 5.0)).await.unwrap();

        let mut again = rec("AAPL", period, 9.0);
        again.created_at = Utc::now();
        let second = store.upsert_recommendation(&again).await.unwrap();

        let all = store.recommendations().await;
        assert_eq!(all.len(), 1);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(all[0].counts, AnalystCounts::synthesize(RecommendationLabel::Buy, 9.0));
    }

    #[tokio::test]
    async fn latest_prefers_newest_period_unless_one_is_given() {
        let store = MemoryStore::new();
        let jan = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        let feb = NaiveDate::from_ymd_opt(2026, 2, 15).unwrap();
        store.upsert_recommendation(&rec("MSFT", jan, 5.0)).await.unwrap();
        store.upsert_recommendation(&rec("MSFT", feb, 6.0)).await.unwrap();

        let latest = store.latest_recommendation("MSFT", None).await.unwrap().unwrap();
        assert_eq!(latest.period, feb);
        let exact = store.latest_recommendation("MSFT", Some(jan)).await.unwrap().unwrap();
        assert_eq!(exact.period, jan);
        assert!(store.latest_recommendation("TSLA", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn price_window_is_ascending_and_bounded() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_prices(
                "NVDA",
                "1day",
                [
                    PricePoint::new(now - Duration::days(1), "3"),
                    PricePoint::new(now - Duration::days(40), "1"),
                    PricePoint::new(now - Duration::days(5), "2"),
                ],
            )
            .await;
        store.insert_prices("AMD", "1day", Vec::new()).await;

        let window = store.historical_prices("NVDA", 30, "1day").await.unwrap();
        let closes: Vec<_> = window.iter().filter_map(|p| p.close.as_deref()).collect();
        assert_eq!(closes, ["2", "3"]);
        assert!(store.historical_prices("NVDA", 30, "1week").await.unwrap().is_empty());
        assert_eq!(store.list_symbols().await.unwrap(), ["AMD", "NVDA"]);
    }
}
