use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::domain::forecast::Observation;
use crate::forecast::{ForecastError, ForecastPoint, Forecaster, Hyperparameters};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Forecast(#[from] ForecastError),

    #[error("forecast did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("forecast worker failed: {0}")]
    Worker(String),
}

/// Runs model fits on the blocking thread pool, at most `workers` at a time,
/// so the async executor stays free for broker I/O and HTTP handling.
///
/// A fit that exceeds the timeout is abandoned, but its slot is only
/// released once the blocking thread actually returns.
#[derive(Clone)]
pub struct ForecastPool {
    forecaster: Arc<dyn Forecaster>,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl ForecastPool {
    pub fn new(forecaster: Arc<dyn Forecaster>, workers: usize, timeout: Option<Duration>) -> Self {
        Self {
            forecaster,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    pub fn forecaster_name(&self) -> &'static str {
        self.forecaster.name()
    }

    pub async fn run(
        &self,
        series: Vec<Observation>,
        params: Hyperparameters,
        horizon_days: u32,
    ) -> Result<Vec<ForecastPoint>, PoolError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| PoolError::Worker(e.to_string()))?;
        let forecaster = Arc::clone(&self.forecaster);

        let job = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            forecaster.fit(&series, &params)?.forecast(horizon_days)
        });

        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, job)
                .await
                .map_err(|_| PoolError::TimedOut(limit))?,
            None => job.await,
        };

        Ok(joined.map_err(|e| PoolError::Worker(e.to_string()))??)
    }
}
