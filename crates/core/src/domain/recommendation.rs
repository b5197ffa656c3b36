use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Every synthesized distribution describes exactly this many analysts.
pub const ANALYST_TOTAL: i32 = 100;

/// |change_percent| at which synthesized confidence saturates.
const CONFIDENCE_SATURATION_PERCENT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationLabel {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl RecommendationLabel {
    pub const ALL: [RecommendationLabel; 5] = [
        RecommendationLabel::StrongBuy,
        RecommendationLabel::Buy,
        RecommendationLabel::Hold,
        RecommendationLabel::Sell,
        RecommendationLabel::StrongSell,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationLabel::StrongBuy => "STRONG_BUY",
            RecommendationLabel::Buy => "BUY",
            RecommendationLabel::Hold => "HOLD",
            RecommendationLabel::Sell => "SELL",
            RecommendationLabel::StrongSell => "STRONG_SELL",
        }
    }
}

impl fmt::Display for RecommendationLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Percent-change cut-offs, evaluated from most bullish to most bearish.
///
/// `strong_sell` is not consulted by [`Thresholds::label_for`] (everything
/// below `sell` is STRONG_SELL); it only bounds the ladder during validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub strong_buy: f64,
    pub buy: f64,
    pub hold: f64,
    pub sell: f64,
    pub strong_sell: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            strong_buy: 10.0,
            buy: 5.0,
            hold: 2.0,
            sell: -5.0,
            strong_sell: -10.0,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> anyhow::Result<()> {
        let ladder = [self.strong_buy, self.buy, self.hold, self.sell, self.strong_sell];
        anyhow::ensure!(
            ladder.iter().all(|v| v.is_finite()),
            "recommendation thresholds must be finite: {ladder:?}"
        );
        anyhow::ensure!(
            self.strong_buy > self.buy && self.buy > self.hold && self.hold > self.sell,
            "recommendation thresholds must be strictly descending (got {ladder:?})"
        );
        anyhow::ensure!(
            self.sell >= self.strong_sell,
            "SELL_THRESHOLD must be >= STRONG_SELL_THRESHOLD (got {} < {})",
            self.sell,
            self.strong_sell
        );
        Ok(())
    }

    /// First match wins; every tier is inclusive on its lower bound.
    pub fn label_for(&self, change_percent: f64) -> RecommendationLabel {
        if change_percent >= self.strong_buy {
            RecommendationLabel::StrongBuy
        } else if change_percent >= self.buy {
            RecommendationLabel::Buy
        } else if change_percent >= self.hold {
            RecommendationLabel::Hold
        } else if change_percent >= self.sell {
            RecommendationLabel::Sell
        } else {
            RecommendationLabel::StrongSell
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalystCounts {
    #[serde(rename = "strongBuy")]
    pub strong_buy: i32,
    pub buy: i32,
    pub hold: i32,
    pub sell: i32,
    #[serde(rename = "strongSell")]
    pub strong_sell: i32,
}

impl AnalystCounts {
    /// Spreads a single point forecast over [`ANALYST_TOTAL`] simulated analysts.
    pub fn synthesize(label: RecommendationLabel, change_percent: f64) -> Self {
        Self::from_confidence(label, confidence(change_percent))
    }

    /// Primary and secondary buckets are truncated; the remainder bucket
    /// absorbs the rounding so the total is always [`ANALYST_TOTAL`].
    pub fn from_confidence(label: RecommendationLabel, confidence: f64) -> Self {
        let c = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        let mut out = Self::default();

        match label {
            RecommendationLabel::StrongBuy => {
                out.strong_buy = (60.0 * c + 10.0) as i32;
                out.buy = (30.0 * c) as i32;
                out.hold = ANALYST_TOTAL - out.strong_buy - out.buy;
            }
            RecommendationLabel::Buy => {
                out.buy = (50.0 * c + 10.0) as i32;
                out.strong_buy = (20.0 * c) as i32;
                out.hold = ANALYST_TOTAL - out.buy - out.strong_buy;
            }
            RecommendationLabel::Hold => {
                out.hold = (60.0 + 20.0 * c) as i32;
                out.buy = (10.0 + 10.0 * (1.0 - c)) as i32;
                out.sell = ANALYST_TOTAL - out.hold - out.buy;
            }
            RecommendationLabel::Sell => {
                out.sell = (50.0 * c + 10.0) as i32;
                out.strong_sell = (20.0 * c) as i32;
                out.hold = ANALYST_TOTAL - out.sell - out.strong_sell;
            }
            RecommendationLabel::StrongSell => {
                out.strong_sell = (60.0 * c + 10.0) as i32;
                out.sell = (30.0 * c) as i32;
                out.hold = ANALYST_TOTAL - out.strong_sell - out.sell;
            }
        }

        out
    }

    pub fn total(&self) -> i32 {
        self.strong_buy + self.buy + self.hold + self.sell + self.strong_sell
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let buckets = [self.strong_buy, self.buy, self.hold, self.sell, self.strong_sell];
        anyhow::ensure!(
            buckets.iter().all(|v| *v >= 0),
            "analyst counts must be non-negative (got {buckets:?})"
        );
        anyhow::ensure!(
            self.total() == ANALYST_TOTAL,
            "analyst counts must sum to {ANALYST_TOTAL} (got {})",
            self.total()
        );
        Ok(())
    }
}

pub fn confidence(change_percent: f64) -> f64 {
    (change_percent.abs() / CONFIDENCE_SATURATION_PERCENT).min(1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecommendationMetadata {
    pub predicted_price: f64,
    pub current_price: f64,
    pub change_percent: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
}

/// One row per (symbol, period); later writes for the same pair overwrite
/// counts and metadata but keep `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub symbol: String,
    pub period: NaiveDate,
    #[serde(flatten)]
    pub counts: AnalystCounts,
    pub metadata: RecommendationMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ladder_is_inclusive_on_the_high_side() {
        let t = Thresholds::default();
        assert_eq!(t.label_for(10.0), RecommendationLabel::StrongBuy);
        assert_eq!(t.label_for(9.999), RecommendationLabel::Buy);
        assert_eq!(t.label_for(6.0), RecommendationLabel::Buy);
        assert_eq!(t.label_for(5.0), RecommendationLabel::Buy);
        assert_eq!(t.label_for(2.0), RecommendationLabel::Hold);
        assert_eq!(t.label_for(0.0), RecommendationLabel::Sell);
        assert_eq!(t.label_for(-5.0), RecommendationLabel::Sell);
        assert_eq!(t.label_for(-6.0), RecommendationLabel::StrongSell);
    }

    #[test]
    fn counts_sum_to_total_for_every_label_and_confidence() {
        for label in RecommendationLabel::ALL {
            for step in 0..=1000 {
                let c = step as f64 / 1000.0;
                let counts = AnalystCounts::from_confidence(label, c);
                assert_eq!(counts.total(), ANALYST_TOTAL, "{label} c={c}");
                counts.validate().unwrap();
            }
        }
    }

    #[test]
    fn strong_buy_at_full_confidence() {
        let counts = AnalystCounts::synthesize(RecommendationLabel::StrongBuy, 25.0);
        assert_eq!(
            counts,
            AnalystCounts {
                strong_buy: 70,
                buy: 30,
                hold: 0,
                sell: 0,
                strong_sell: 0,
            }
        );
    }

    #[test]
    fn hold_truncates_and_remainder_goes_to_sell() {
        // c = 0.25 -> hold = 65, buy = floor(17.5) = 17, sell = 18
        let counts = AnalystCounts::synthesize(RecommendationLabel::Hold, 5.0);
        assert_eq!(counts.hold, 65);
        assert_eq!(counts.buy, 17);
        assert_eq!(counts.sell, 18);
        assert_eq!(counts.strong_buy, 0);
        assert_eq!(counts.strong_sell, 0);
    }

    #[test]
    fn sell_uses_absolute_change_for_confidence() {
        // c = 0.25 -> sell = floor(22.5) = 22, strong_sell = 5, hold = 73
        let counts = AnalystCounts::synthesize(RecommendationLabel::Sell, -5.0);
        assert_eq!((counts.sell, counts.strong_sell, counts.hold), (22, 5, 73));
    }

    #[test]
    fn rejects_non_descending_thresholds() {
        let t = Thresholds {
            buy: 12.0,
            ..Thresholds::default()
        };
        assert!(t.validate().is_err());
        assert!(Thresholds::default().validate().is_ok());
    }

    #[test]
    fn serializes_counts_with_camel_case_extremes() {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let rec = Recommendation {
            id: None,
            symbol: "AAPL".to_string(),
            period: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            counts: AnalystCounts::synthesize(RecommendationLabel::Buy, 5.0),
            metadata: RecommendationMetadata {
                predicted_price: 105.0,
                current_price: 100.0,
                change_percent: 5.0,
                confidence_lower: 95.0,
                confidence_upper: 117.0,
            },
            created_at: at,
            updated_at: at,
        };

        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["period"], "2026-04-01");
        assert_eq!(v["strongBuy"], 5);
        assert_eq!(v["buy"], 22);
        assert_eq!(v["hold"], 73);
        assert!(v.get("id").is_none());
        assert!(v.get("counts").is_none());

        let back: Recommendation = serde_json::from_value(v).unwrap();
        assert_eq!(back, rec);
    }
}
