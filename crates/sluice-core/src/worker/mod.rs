//! Stage workers: lease one message, process it, acknowledge on success.
//!
//! A worker walks `Idle -> Leased -> Processing -> {Committed, Failed}` for
//! every message. `Failed` never acknowledges; the lease expires and the
//! queue redelivers or dead-letters the message.

mod nlp;
mod pool;
mod scraper;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::alert::{Signal, SignalSender};
use crate::error::{ProcessError, WorkerError};
use crate::message::Delivery;
use crate::metrics::Metrics;
use crate::queue::{AckOutcome, Queue};

pub use nlp::{
    Analysis, AnalysisOutcome, Analyzer, ExtractRequest, FollowUp, MemoryResultStore, NlpStage,
    OutcomeStatus, ResultStore, RetrieveRequest, StorageResultStore, UpdateKind,
};
pub use pool::WorkerPool;
pub use scraper::{IngestReport, IngestRequest, Ingestor, ScraperStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Leased,
    Processing,
    Committed,
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Leased => "leased",
            WorkerState::Processing => "processing",
            WorkerState::Committed => "committed",
            WorkerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The opaque business logic of one stage.
///
/// Returning `Ok` means every downstream effect is durable and the message
/// may be acknowledged. Implementations must be idempotent.
pub trait Processor: Send + Sync {
    fn stage(&self) -> &str;

    fn process(&self, delivery: &Delivery) -> impl Future<Output = Result<(), ProcessError>> + Send;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Long-poll wait per receive.
    pub wait_timeout: Duration,
    /// Must stay below the queue's visibility timeout.
    pub processing_timeout: Duration,
    pub restart_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(20),
            processing_timeout: Duration::from_secs(14 * 60),
            restart_delay: Duration::from_secs(5),
        }
    }
}

pub struct Worker<Q, P> {
    queue: Arc<Q>,
    processor: Arc<P>,
    config: WorkerConfig,
    state: WorkerState,
    metrics: Metrics,
    signals: Option<SignalSender>,
}

impl<Q: Queue, P: Processor> Worker<Q, P> {
    pub fn new(queue: Arc<Q>, processor: Arc<P>, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
            state: WorkerState::Idle,
            metrics: Metrics::new(),
            signals: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_signals(mut self, signals: SignalSender) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(stage = self.processor.stage(), from = %self.state, to = %next, "worker transition");
        self.state = next;
    }

    /// Run one receive/process/acknowledge cycle and return the state it ended
    /// in: `Idle` when nothing was available, otherwise `Committed` or `Failed`.
    pub async fn handle_one(&mut self) -> Result<WorkerState, WorkerError> {
        self.transition(WorkerState::Idle);
        let mut batch = self.queue.receive(1, self.config.wait_timeout).await?;
        let Some(delivery) = batch.pop() else {
            return Ok(WorkerState::Idle);
        };
        self.transition(WorkerState::Leased);

        self.transition(WorkerState::Processing);
        let result = match tokio::time::timeout(
            self.config.processing_timeout,
            self.processor.process(&delivery),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProcessError::Timeout(self.config.processing_timeout)),
        };

        match result {
            Ok(()) => {
                if self.queue.acknowledge(&delivery.receipt).await? == AckOutcome::Stale {
                    warn!(
                        stage = self.processor.stage(),
                        msg_id = %delivery.message_id,
                        "lease expired before commit, message will be processed again"
                    );
                }
                self.transition(WorkerState::Committed);
            }
            Err(err) => {
                error!(
                    stage = self.processor.stage(),
                    queue = self.queue.name(),
                    msg_id = %delivery.message_id,
                    delivery_count = delivery.delivery_count,
                    error = %err,
                    error_code = "worker_failed",
                    "Error processing message"
                );
                self.metrics.record_worker_failure(self.processor.stage());
                if let Some(signals) = &self.signals {
                    signals.emit(Signal::WorkerError {
                        stage: self.processor.stage().to_string(),
                    });
                }
                self.transition(WorkerState::Failed);
            }
        }
        Ok(self.state)
    }

    /// Process messages until `shutdown` flips to true. Returns early only on
    /// queue infrastructure errors.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        info!(stage = self.processor.stage(), queue = self.queue.name(), "worker started");
        while !*shutdown.borrow() {
            tokio::select! {
                result = self.handle_one() => {
                    result?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(stage = self.processor.stage(), "worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::alert::signal_channel;
    use crate::clock::ManualClock;
    use crate::queue::{LeaseQueue, QueueConfig};
    use crate::storage::MemoryStorage;

    struct Scripted {
        calls: AtomicUsize,
        fail_first: usize,
        sleep: Duration,
    }

    impl Scripted {
        fn new(fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
                sleep: Duration::ZERO,
            }
        }
    }

    impl Processor for Scripted {
        fn stage(&self) -> &str {
            "test"
        }

        async fn process(&self, _delivery: &Delivery) -> Result<(), ProcessError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.sleep.is_zero() {
                tokio::time::sleep(self.sleep).await;
            }
            if call < self.fail_first {
                Err(ProcessError::Handler("scripted failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn queue(clock: &ManualClock) -> Arc<LeaseQueue> {
        Arc::new(
            LeaseQueue::open(
                QueueConfig::new("work").with_visibility_timeout(Duration::from_secs(30)),
                Arc::new(MemoryStorage::new()),
                Arc::new(clock.clone()),
            )
            .unwrap(),
        )
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            wait_timeout: Duration::ZERO,
            processing_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn success_acknowledges() {
        let clock = ManualClock::new(0);
        let queue = queue(&clock);
        queue.enqueue(b"{}".to_vec()).await.unwrap();

        let mut worker = Worker::new(Arc::clone(&queue), Arc::new(Scripted::new(0)), config());
        assert_eq!(worker.handle_one().await.unwrap(), WorkerState::Committed);
        assert_eq!(queue.stats().unwrap().depth(), 0);
        assert_eq!(worker.handle_one().await.unwrap(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn failure_leaves_message_for_redelivery() {
        let clock = ManualClock::new(0);
        let queue = queue(&clock);
        queue.enqueue(b"{}".to_vec()).await.unwrap();
        let (tx, rx) = signal_channel(8);

        let mut worker = Worker::new(Arc::clone(&queue), Arc::new(Scripted::new(1)), config())
            .with_signals(tx);
        assert_eq!(worker.handle_one().await.unwrap(), WorkerState::Failed);
        assert_eq!(queue.stats().unwrap().in_flight, 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            Signal::WorkerError {
                stage: "test".to_string()
            }
        );

        assert_eq!(worker.handle_one().await.unwrap(), WorkerState::Idle);
        clock.advance(Duration::from_secs(30));
        assert_eq!(worker.handle_one().await.unwrap(), WorkerState::Committed);
        assert_eq!(queue.stats().unwrap().depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_processing_times_out() {
        let clock = ManualClock::new(0);
        let queue = queue(&clock);
        queue.enqueue(b"{}".to_vec()).await.unwrap();

        let mut slow = Scripted::new(0);
        slow.sleep = Duration::from_secs(60);
        let mut worker = Worker::new(Arc::clone(&queue), Arc::new(slow), config());
        assert_eq!(worker.handle_one().await.unwrap(), WorkerState::Failed);
        assert_eq!(queue.stats().unwrap().in_flight, 1);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let clock = ManualClock::new(0);
        let queue = queue(&clock);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(
            queue,
            Arc::new(Scripted::new(0)),
            WorkerConfig {
                wait_timeout: Duration::from_millis(50),
                ..config()
            },
        );
        let handle = tokio::spawn(worker.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
