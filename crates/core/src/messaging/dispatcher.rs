use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::config::DispatchSettings;
use crate::domain::contract::StockUpdateEvent;
use crate::messaging::Publisher;
use crate::pipeline::ForecastPipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Accepted; the pipeline will run for this symbol.
    Queued(String),
    /// Malformed or symbol-less event; logged and skipped.
    Dropped,
    /// The dispatcher is shutting down and no longer accepts work.
    Closed,
}

/// Hands consumed events to the forecast pipeline without making the
/// consume loop wait for any forecast. Work is buffered in a bounded queue
/// and executed by at most `concurrency` tasks; the only time `dispatch`
/// waits is when that queue is full.
///
/// No dedup and no per-symbol ordering: two events for one symbol may run
/// concurrently and the later-finishing write wins.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<String>,
}

impl Dispatcher {
    /// Returns the dispatcher and the executor task. The task finishes
    /// once every `Dispatcher` clone is dropped and in-flight jobs are done.
    pub fn start(
        pipeline: Arc<ForecastPipeline>,
        publisher: Arc<dyn Publisher>,
        settings: DispatchSettings,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        let task = tokio::spawn(run_executor(
            rx,
            pipeline,
            publisher,
            settings.concurrency.max(1),
        ));
        (Self { tx }, task)
    }

    pub async fn dispatch(&self, payload: &[u8]) -> DispatchOutcome {
        let symbol = match StockUpdateEvent::from_payload(payload).and_then(|e| e.validated_symbol()) {
            Ok(symbol) => symbol,
            Err(e) => {
                tracing::warn!(error = %e, "dropping stock update event");
                return DispatchOutcome::Dropped;
            }
        };
        self.dispatch_symbol(symbol).await
    }

    pub async fn dispatch_symbol(&self, symbol: String) -> DispatchOutcome {
        match self.tx.send(symbol.clone()).await {
            Ok(()) => {
                tracing::debug!(%symbol, "stock update queued");
                DispatchOutcome::Queued(symbol)
            }
            Err(_) => DispatchOutcome::Closed,
        }
    }
}

async fn run_executor(
    mut rx: mpsc::Receiver<String>,
    pipeline: Arc<ForecastPipeline>,
    publisher: Arc<dyn Publisher>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));

    while let Some(symbol) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let pipeline = Arc::clone(&pipeline);
        let publisher = Arc::clone(&publisher);
        tokio::spawn(async move {
            let _permit = permit;
            if let Some(rec) = pipeline.generate_recommendation(&symbol, None).await {
                publisher.publish(&rec).await;
            }
        });
    }

    // Drain: wait for running jobs before reporting done.
    let _ = permits.acquire_many(concurrency as u32).await;
    tracing::debug!("dispatcher drained");
}
