//! Broker side of the pipeline: startup retry, the Kafka producer and
//! consumer, and the dispatcher sitting between consumed events and the
//! forecast pipeline.

pub mod dispatcher;
pub mod kafka;
pub mod retry;

use serde::Serialize;
use std::fmt;
use tokio::sync::Mutex;

use crate::domain::recommendation::Recommendation;

/// Best-effort republish of a stored recommendation. Implementations make a
/// single attempt and report the outcome; failures are never propagated.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, rec: &Recommendation) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerStatus {
    Starting,
    Running,
    Unavailable,
    Stopped,
}

impl ConsumerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerStatus::Starting => "starting",
            ConsumerStatus::Running => "running",
            ConsumerStatus::Unavailable => "unavailable",
            ConsumerStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keeps everything it is asked to publish. Used for local runs and tests.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Recommendation>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<Recommendation> {
        self.published.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Publisher for RecordingPublisher {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn publish(&self, rec: &Recommendation) -> bool {
        self.published.lock().await.push(rec.clone());
        true
    }
}
