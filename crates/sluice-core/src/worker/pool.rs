use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{Processor, Worker, WorkerConfig};
use crate::alert::SignalSender;
use crate::metrics::Metrics;
use crate::queue::Queue;

/// Runs `concurrency` workers over one queue and one processor.
///
/// Worker loops that stop with an error are restarted after
/// `restart_delay`; the pool only exits once `shutdown` is set.
pub struct WorkerPool<Q, P> {
    queue: Arc<Q>,
    processor: Arc<P>,
    config: WorkerConfig,
    concurrency: usize,
    metrics: Metrics,
    signals: Option<SignalSender>,
}

impl<Q, P> WorkerPool<Q, P>
where
    Q: Queue + 'static,
    P: Processor + 'static,
{
    pub fn new(queue: Arc<Q>, processor: P, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            config,
            concurrency: 1,
            metrics: Metrics::new(),
            signals: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_signals(mut self, signals: SignalSender) -> Self {
        self.signals = Some(signals);
        self
    }

    fn worker(&self) -> Worker<Q, P> {
        let worker = Worker::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.processor),
            self.config.clone(),
        )
        .with_metrics(self.metrics.clone());
        match &self.signals {
            Some(signals) => worker.with_signals(signals.clone()),
            None => worker,
        }
    }

    /// Spawn every worker loop. Await the handles to wait for shutdown.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let pool = Arc::new(self);
        (0..pool.concurrency)
            .map(|worker_id| {
                let pool = Arc::clone(&pool);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let stage = pool.processor.stage().to_string();
                    loop {
                        tracing::info!(stage = %stage, worker_id, "starting worker loop");
                        match pool.worker().run(shutdown.clone()).await {
                            Ok(()) => break,
                            Err(e) => {
                                tracing::error!(
                                    stage = %stage,
                                    worker_id,
                                    error = %e,
                                    restart_delay_ms = pool.config.restart_delay.as_millis() as u64,
                                    "worker loop crashed, restarting"
                                );
                                tokio::time::sleep(pool.config.restart_delay).await;
                            }
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ProcessError;
    use crate::message::Delivery;
    use crate::queue::{LeaseQueue, QueueConfig};
    use crate::storage::MemoryStorage;

    #[derive(Default)]
    struct Counting {
        seen: AtomicUsize,
    }

    impl Processor for Counting {
        fn stage(&self) -> &str {
            "counting"
        }

        async fn process(&self, _delivery: &Delivery) -> Result<(), ProcessError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops() {
        let queue = Arc::new(
            LeaseQueue::open(
                QueueConfig::new("work"),
                Arc::new(MemoryStorage::new()),
                Arc::new(ManualClock::new(0)),
            )
            .unwrap()
            .with_poll_interval(Duration::from_millis(5)),
        );
        for i in 0..12u8 {
            queue.enqueue(vec![i]).await.unwrap();
        }

        let config = WorkerConfig {
            wait_timeout: Duration::from_millis(20),
            processing_timeout: Duration::from_secs(1),
            restart_delay: Duration::from_millis(10),
        };
        let pool = WorkerPool::new(Arc::clone(&queue), Counting::default(), config)
            .with_concurrency(3);
        let processor = Arc::clone(&pool.processor);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = pool.spawn(shutdown_rx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.stats().unwrap().depth() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(processor.seen.load(Ordering::SeqCst), 12);
    }
}
