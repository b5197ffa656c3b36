use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::KafkaSettings;
use crate::domain::recommendation::Recommendation;
use crate::messaging::dispatcher::{DispatchOutcome, Dispatcher};
use crate::messaging::retry::{connect_with_retry, ConnectError, RetryPolicy};
use crate::messaging::{ConsumerStatus, Publisher};

impl KafkaSettings {
    pub fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("acks", "all")
            // One attempt per publish; a failed send is logged, not retried.
            .set("message.send.max.retries", "0")
            .set("message.timeout.ms", self.publish_timeout.as_millis().to_string());
        config
    }

    pub fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &self.group_id)
            .set("auto.offset.reset", "latest")
            .set("enable.auto.commit", "true")
            // Offsets are stored by hand once the dispatcher has the event.
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "20000")
            .set("max.poll.interval.ms", "300000");
        config
    }
}

/// Producer for the predictions topic. Constructing one proves the cluster
/// was reachable at least once.
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Exhausting the retry budget is returned as an error; the service
    /// treats that as fatal at boot.
    pub async fn connect(settings: &KafkaSettings, policy: RetryPolicy) -> Result<Self, ConnectError> {
        let metadata_timeout = settings.metadata_timeout;
        let producer = connect_with_retry(policy, "kafka producer", |_| {
            let config = settings.producer_config();
            async move {
                let producer: FutureProducer =
                    config.create().context("create kafka producer failed")?;
                let probe = producer.clone();
                tokio::task::spawn_blocking(move || {
                    probe
                        .client()
                        .fetch_metadata(None, metadata_timeout)
                        .map(|_| ())
                })
                .await
                .context("kafka metadata task failed")?
                .context("kafka cluster unreachable")?;
                Ok::<_, anyhow::Error>(producer)
            }
        })
        .await?;

        tracing::info!(
            servers = %settings.bootstrap_servers,
            topic = %settings.topic_predictions,
            "kafka producer connected"
        );
        Ok(Self {
            producer,
            topic: settings.topic_predictions.clone(),
            timeout: settings.publish_timeout,
        })
    }

    /// Waits for in-flight deliveries; called on shutdown.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .context("kafka flush task failed")?
            .context("kafka flush failed")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Publisher for KafkaPublisher {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn publish(&self, rec: &Recommendation) -> bool {
        let payload = match serde_json::to_vec(rec) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(symbol = %rec.symbol, error = %e, "recommendation serialize failed");
                return false;
            }
        };

        let record = FutureRecord::to(&self.topic)
            .key(rec.symbol.as_str())
            .payload(&payload);

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::info!(
                    symbol = %rec.symbol,
                    period = %rec.period,
                    partition,
                    offset,
                    "recommendation published"
                );
                true
            }
            Err((e, _)) => {
                tracing::warn!(
                    symbol = %rec.symbol,
                    period = %rec.period,
                    error = %e,
                    "recommendation publish failed; already persisted, not retrying"
                );
                false
            }
        }
    }
}

/// Background consumer of the stock-updates topic.
pub struct ConsumerHandle {
    status: watch::Receiver<ConsumerStatus>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn status(&self) -> ConsumerStatus {
        *self.status.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConsumerStatus> {
        self.status.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "kafka consumer task ended abnormally");
        }
    }
}

/// Starts the consumer in the background. Connection failures never reach
/// the caller: once retries run out the status turns `unavailable` and the
/// rest of the service keeps running.
pub fn spawn_consumer(
    settings: KafkaSettings,
    policy: RetryPolicy,
    dispatcher: Dispatcher,
) -> ConsumerHandle {
    let (status_tx, status_rx) = watch::channel(ConsumerStatus::Starting);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let connected = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                let _ = status_tx.send(ConsumerStatus::Stopped);
                return;
            }
            res = start_consumer(&settings, policy) => res,
        };

        let consumer = match connected {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    topic = %settings.topic_stock_updates,
                    error = %e,
                    "kafka consumer unavailable; continuing without live events"
                );
                let _ = status_tx.send(ConsumerStatus::Unavailable);
                return;
            }
        };

        let _ = status_tx.send(ConsumerStatus::Running);
        tracing::info!(
            topic = %settings.topic_stock_updates,
            group = %settings.group_id,
            "kafka consumer running"
        );

        consume(&consumer, &dispatcher, &mut shutdown_rx).await;

        if let Err(e) = consumer.commit_consumer_state(CommitMode::Sync) {
            tracing::debug!(error = %e, "final offset commit skipped");
        }
        consumer.unsubscribe();
        let _ = status_tx.send(ConsumerStatus::Stopped);
        tracing::info!("kafka consumer stopped");
    });

    ConsumerHandle {
        status: status_rx,
        shutdown: shutdown_tx,
        task,
    }
}

async fn start_consumer(
    settings: &KafkaSettings,
    policy: RetryPolicy,
) -> Result<Arc<StreamConsumer>, ConnectError> {
    let metadata_timeout = settings.metadata_timeout;
    connect_with_retry(policy, "kafka consumer", |_| {
        let config = settings.consumer_config();
        let topic = settings.topic_stock_updates.clone();
        async move {
            let consumer: Arc<StreamConsumer> =
                Arc::new(config.create().context("create kafka consumer failed")?);

            let probe = Arc::clone(&consumer);
            let probe_topic = topic.clone();
            let known = tokio::task::spawn_blocking(move || {
                probe
                    .fetch_metadata(Some(&probe_topic), metadata_timeout)
                    .map(|metadata| {
                        metadata.topics().iter().any(|t| {
                            t.name() == probe_topic
                                && t.error().is_none()
                                && !t.partitions().is_empty()
                        })
                    })
            })
            .await
            .context("kafka metadata task failed")?
            .context("kafka cluster unreachable")?;
            anyhow::ensure!(known, "topic {topic} does not exist yet");

            consumer
                .subscribe(&[topic.as_str()])
                .with_context(|| format!("subscribe to {topic} failed"))?;
            Ok::<_, anyhow::Error>(consumer)
        }
    })
    .await
}

async fn consume(
    consumer: &StreamConsumer,
    dispatcher: &Dispatcher,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            msg = consumer.recv() => msg,
        };

        let msg = match received {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "kafka consumer error");
                continue;
            }
        };

        match msg.payload() {
            Some(payload) => {
                if let DispatchOutcome::Closed = dispatcher.dispatch(payload).await {
                    // Not stored, so the event is redelivered after restart.
                    break;
                }
            }
            None => tracing::debug!(offset = msg.offset(), "skipping empty kafka message"),
        }

        if let Err(e) = consumer.store_offset_from_message(&msg) {
            tracing::warn!(offset = msg.offset(), error = %e, "kafka offset store failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatchSettings, Settings};
    use crate::messaging::RecordingPublisher;
    use crate::pipeline::testing::{pipeline, FixedChange};
    use crate::storage::memory::MemoryStore;

    #[test]
    fn producer_makes_a_single_attempt() {
        let settings = Settings::default().kafka;
        let config = settings.producer_config();
        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(config.get("message.send.max.retries"), Some("0"));
        assert_eq!(config.get("message.timeout.ms"), Some("30000"));
    }

    #[test]
    fn consumer_reads_new_messages_and_stores_offsets_by_hand() {
        let settings = Settings::default().kafka;
        let config = settings.consumer_config();
        assert_eq!(config.get("group.id"), Some("stockcast-consumer"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("session.timeout.ms"), Some("60000"));
        assert_eq!(config.get("heartbeat.interval.ms"), Some("20000"));
    }

    #[tokio::test]
    async fn unreachable_broker_leaves_consumer_unavailable() {
        let mut settings = Settings::default().kafka;
        settings.bootstrap_servers = "127.0.0.1:1".to_string();
        settings.metadata_timeout = Duration::from_millis(200);
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(10),
        };
        let (dispatcher, _dispatch_task) = Dispatcher::start(
            Arc::new(pipeline(Arc::new(MemoryStore::new()), FixedChange(1.0))),
            Arc::new(RecordingPublisher::new()),
            DispatchSettings {
                concurrency: 1,
                queue_depth: 1,
            },
        );

        // Returns at once; the connection attempts happen in the background.
        let handle = spawn_consumer(settings, policy, dispatcher);
        let mut status = handle.status_receiver();
        let reached = tokio::time::timeout(
            Duration::from_secs(15),
            status.wait_for(|s| *s == ConsumerStatus::Unavailable),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

        assert!(reached, "consumer status stuck at {}", handle.status());
        assert_eq!(handle.status(), ConsumerStatus::Unavailable);
        handle.shutdown().await;
    }
}
