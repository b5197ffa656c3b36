use std::future::Future;
use std::time::Duration;

/// Fixed-delay retry budget used for every startup connection (store,
/// producer, consumer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Total time spent sleeping when every attempt fails.
    pub fn worst_case_backoff(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("{what}: giving up after {attempts} attempts: {last:#}")]
    Exhausted {
        what: &'static str,
        attempts: u32,
        last: anyhow::Error,
    },
}

/// Calls `connect` until it succeeds or the budget is spent. The attempt
/// number (1-based) is passed in for logging. Sleeps only between attempts.
pub async fn connect_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    what: &'static str,
    mut connect: F,
) -> Result<T, ConnectError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match connect(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(what, attempt, "connected after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt >= max_attempts {
                    tracing::error!(what, attempt, error = %err, "connection retries exhausted");
                    return Err(ConnectError::Exhausted {
                        what,
                        attempts: attempt,
                        last: err,
                    });
                }
                let backoff = policy.delay;
                tracing::warn!(what, attempt, max_attempts, ?backoff, error = %err, "connect failed; retrying");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn unreachable_target_fails_after_full_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let counter = calls.clone();
        let res: Result<(), ConnectError> =
            connect_with_retry(RetryPolicy::default(), "producer", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("connection refused"))
                }
            })
            .await;

        let ConnectError::Exhausted { attempts, .. } = res.unwrap_err();
        assert_eq!(attempts, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(started.elapsed(), Duration::from_secs(45));
        assert_eq!(RetryPolicy::default().worst_case_backoff(), Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_a_later_attempt() {
        let started = tokio::time::Instant::now();
        let policy = RetryPolicy {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        };

        let value = connect_with_retry(policy, "consumer", |attempt| async move {
            if attempt < 3 {
                anyhow::bail!("topic not found");
            }
            Ok(attempt)
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_still_tries_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            delay: Duration::from_secs(1),
        };
        let res: Result<(), _> =
            connect_with_retry(policy, "store", |_| async {
                Err::<(), _>(anyhow::anyhow!("down"))
            }).await;
        let ConnectError::Exhausted { attempts, .. } = res.unwrap_err();
        assert_eq!(attempts, 1);
    }
}
