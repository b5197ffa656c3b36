use std::time::Duration;

use crate::forecast::pool::PoolError;

/// Why a pipeline run produced no recommendation. Callers only ever see
/// `None`; this is what ends up in the log line.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("insufficient history: {got} usable points, need {need}")]
    InsufficientData { got: usize, need: usize },

    #[error("failed to fetch price history: {0:#}")]
    Fetch(anyhow::Error),

    #[error("price history unusable: {0}")]
    Cleaning(String),

    #[error("forecast failed: {0}")]
    Computation(String),

    #[error("forecast did not finish within {0:?}")]
    Timeout(Duration),

    #[error("failed to persist recommendation: {0:#}")]
    Persistence(anyhow::Error),
}

impl PipelineError {
    /// Not enough data is an expected outcome, not a fault.
    pub fn is_soft(&self) -> bool {
        matches!(self, PipelineError::InsufficientData { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InsufficientData { .. } => "insufficient_data",
            PipelineError::Fetch(_) => "fetch",
            PipelineError::Cleaning(_) => "cleaning",
            PipelineError::Computation(_) => "computation",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::Persistence(_) => "persistence",
        }
    }
}

impl From<PoolError> for PipelineError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::TimedOut(limit) => PipelineError::Timeout(limit),
            other => PipelineError::Computation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::ForecastError;

    #[test]
    fn pool_timeouts_keep_their_own_kind() {
        let err = PipelineError::from(PoolError::TimedOut(Duration::from_secs(3)));
        assert_eq!(err.kind(), "timeout");

        let err = PipelineError::from(PoolError::Forecast(ForecastError::Degenerate(
            "flat".to_string(),
        )));
        assert_eq!(err.kind(), "computation");
        assert!(err.to_string().contains("flat"));
        assert!(!err.is_soft());
    }
}
