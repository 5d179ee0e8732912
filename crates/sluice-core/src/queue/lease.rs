use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AckOutcome, Queue, QueueConfig, QueueStats};
use crate::alert::{Signal, SignalSender};
use crate::clock::{duration_ns, Clock};
use crate::error::{AckError, ConfigError, EnqueueError, ReceiveError, StorageError};
use crate::message::{DeadLetter, Delivery, Message, ReceiptHandle};
use crate::metrics::Metrics;
use crate::storage::{keys, Storage, WriteBatchOp};

/// Hosted queues cap a receive at ten messages; so do we.
pub const MAX_BATCH: usize = 10;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A queue whose in-flight state lives entirely in per-message deadlines.
///
/// There are no background timers: every `receive` scans the queue in key
/// order and treats a message as visible once its deadline has passed. A
/// visible message that has already been delivered `max_receive_count` times
/// is relocated to the dead-letter queue in the same atomic batch instead of
/// being handed out again.
///
/// Open at most one `LeaseQueue` per queue name per storage: the transition
/// lock is what makes receive, acknowledge and relocation atomic with respect
/// to each other.
pub struct LeaseQueue {
    config: QueueConfig,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    transitions: Mutex<()>,
    available: Notify,
    poll_interval: Duration,
    pub(super) metrics: Metrics,
    pub(super) signals: Option<SignalSender>,
}

impl LeaseQueue {
    /// Validate and persist `config`, then open the queue over `storage`.
    pub fn open(
        config: QueueConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        storage.put_queue(&config.name, &config)?;

        info!(
            queue = %config.name,
            visibility_timeout_ms = config.visibility_timeout_ms,
            max_receive_count = config.max_receive_count,
            dead_letter_queue = config.dead_letter_queue.as_deref().unwrap_or("-"),
            "queue opened"
        );

        Ok(Self {
            config,
            storage,
            clock,
            transitions: Mutex::new(()),
            available: Notify::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            metrics: Metrics::new(),
            signals: None,
        })
    }

    /// Reopen a queue with the configuration it was last opened with.
    pub fn open_existing(
        name: &str,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let config = storage
            .get_queue(name)?
            .ok_or_else(|| ConfigError::UnknownQueue(name.to_string()))?;
        Self::open(config, storage, clock)
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Report dead-letter arrivals to the alert sink.
    pub fn with_signals(mut self, signals: SignalSender) -> Self {
        self.signals = Some(signals);
        self
    }

    /// How often a waiting `receive` rechecks for expired leases.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(super) fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub(super) fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub(super) fn lock(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.transitions.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub(super) fn wake_receivers(&self) {
        self.available.notify_waiters();
    }

    /// Store a new message, invisible for `delay`.
    pub fn put(&self, payload: Vec<u8>, delay: Duration) -> Result<Uuid, EnqueueError> {
        if payload.len() > self.config.max_payload_bytes {
            return Err(EnqueueError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_payload_bytes,
            });
        }

        let now = self.clock.now_ns();
        let mut message = Message::new(&self.config.name, payload, now);
        if !delay.is_zero() {
            message.visibility_deadline = Some(now.saturating_add(duration_ns(delay)));
        }
        let key = keys::message_key(&self.config.name, now, &message.id)?;

        // A fresh key cannot collide with any in-flight transition.
        self.storage.put_message(&key, &message)?;

        self.metrics.record_enqueue(&self.config.name);
        debug!(
            queue = %self.config.name,
            msg_id = %message.id,
            delay_ms = delay.as_millis() as u64,
            "message enqueued"
        );
        self.wake_receivers();
        Ok(message.id)
    }

    /// Non-blocking receive: lease up to `max_batch` visible messages right now,
    /// dead-lettering any visible message whose receive budget is spent.
    pub fn try_receive(&self, max_batch: usize) -> Result<Vec<Delivery>, ReceiveError> {
        if max_batch == 0 || max_batch > MAX_BATCH {
            return Err(ReceiveError::InvalidBatchSize {
                requested: max_batch,
                max: MAX_BATCH,
            });
        }

        let guard = self.lock()?;
        let now = self.clock.now_ns();
        let lease_until = now.saturating_add(duration_ns(self.config.visibility_timeout()));
        let prefix = keys::queue_prefix(&self.config.name)?;

        let mut ops = Vec::new();
        let mut deliveries = Vec::with_capacity(max_batch);
        let mut relocated = Vec::new();

        for (key, mut msg) in self.storage.list_messages(&prefix)? {
            if deliveries.len() >= max_batch {
                break;
            }
            if !msg.is_visible(now) {
                continue;
            }

            if msg.delivery_count >= self.config.max_receive_count {
                if let Some(dlq) = self.config.dead_letter_queue.as_deref() {
                    let reason = format!(
                        "exceeded max_receive_count of {}",
                        self.config.max_receive_count
                    );
                    relocated.push((msg.id, msg.delivery_count));
                    ops.extend(self.relocation_ops(key, msg, dlq, reason, now)?);
                    continue;
                }
            }

            let nonce = Uuid::now_v7();
            msg.delivery_count += 1;
            msg.receipt = Some(nonce);
            msg.visibility_deadline = Some(lease_until);

            deliveries.push(Delivery {
                message_id: msg.id,
                receipt: ReceiptHandle {
                    queue_id: self.config.name.clone(),
                    enqueued_at: msg.enqueued_at,
                    message_id: msg.id,
                    nonce,
                },
                payload: msg.payload.clone(),
                delivery_count: msg.delivery_count,
                enqueued_at: msg.enqueued_at,
            });
            ops.push(WriteBatchOp::PutMessage {
                key,
                value: serde_json::to_vec(&msg).map_err(StorageError::from)?,
            });
        }

        if !ops.is_empty() {
            self.storage.write_batch(ops)?;
        }
        drop(guard);

        for (msg_id, delivery_count) in relocated {
            self.after_relocation(&msg_id, delivery_count);
        }
        if !deliveries.is_empty() {
            self.metrics
                .record_receive(&self.config.name, deliveries.len() as u64);
            for delivery in &deliveries {
                debug!(
                    queue = %self.config.name,
                    msg_id = %delivery.message_id,
                    delivery_count = delivery.delivery_count,
                    "message leased"
                );
            }
        }
        Ok(deliveries)
    }

    /// Remove the message leased under `receipt`, if the receipt still owns it.
    pub fn delete(&self, receipt: &ReceiptHandle) -> Result<AckOutcome, AckError> {
        if receipt.queue_id != self.config.name {
            return Err(AckError::WrongQueue {
                queue: self.config.name.clone(),
                receipt_queue: receipt.queue_id.clone(),
            });
        }
        let key = keys::message_key(&receipt.queue_id, receipt.enqueued_at, &receipt.message_id)?;

        let guard = self.lock()?;
        let owned = self
            .storage
            .get_message(&key)?
            .is_some_and(|msg| msg.receipt == Some(receipt.nonce));
        if owned {
            self.storage
                .write_batch(vec![WriteBatchOp::DeleteMessage { key }])?;
        }
        drop(guard);

        if owned {
            self.metrics.record_ack(&self.config.name);
            debug!(queue = %self.config.name, msg_id = %receipt.message_id, "message acknowledged");
            Ok(AckOutcome::Deleted)
        } else {
            self.metrics.record_stale_ack(&self.config.name);
            warn!(
                queue = %self.config.name,
                msg_id = %receipt.message_id,
                "acknowledge ignored: receipt no longer owns the message"
            );
            Ok(AckOutcome::Stale)
        }
    }

    /// Counts of visible, in-flight, delayed and dead-lettered messages.
    pub fn stats(&self) -> Result<QueueStats, StorageError> {
        let now = self.clock.now_ns();
        let mut stats = QueueStats::default();
        for (_, msg) in self
            .storage
            .list_messages(&keys::queue_prefix(&self.config.name)?)?
        {
            if msg.is_visible(now) {
                stats.visible += 1;
            } else if msg.is_in_flight(now) {
                stats.in_flight += 1;
            } else {
                stats.delayed += 1;
            }
        }
        stats.dead_letters = self.dead_letters()?.len() as u64;
        self.metrics.set_queue_depth(&self.config.name, stats.depth());
        Ok(stats)
    }

    /// Batch ops that move one message into `dlq`. The caller holds the lock.
    pub(super) fn relocation_ops(
        &self,
        key: Vec<u8>,
        mut msg: Message,
        dlq: &str,
        reason: String,
        now: u64,
    ) -> Result<Vec<WriteBatchOp>, StorageError> {
        msg.receipt = None;
        msg.visibility_deadline = None;
        let dl_key = keys::dead_letter_key(dlq, now, &msg.id)?;
        let dead = DeadLetter {
            message: msg,
            source_queue: self.config.name.clone(),
            reason,
            dead_lettered_at: now,
        };
        Ok(vec![
            WriteBatchOp::DeleteMessage { key },
            WriteBatchOp::PutDeadLetter {
                key: dl_key,
                value: serde_json::to_vec(&dead)?,
            },
        ])
    }

    pub(super) fn after_relocation(&self, msg_id: &Uuid, delivery_count: u32) {
        let dlq = self.config.dead_letter_queue.as_deref().unwrap_or("-");
        warn!(
            queue = %self.config.name,
            %msg_id,
            delivery_count,
            dead_letter_queue = dlq,
            error_code = "message_dead_lettered",
            "message moved to dead-letter queue"
        );
        self.metrics.record_dead_letter(&self.config.name);
        if let Some(signals) = &self.signals {
            signals.emit(Signal::DeadLettered {
                queue: self.config.name.clone(),
            });
        }
    }
}

impl Queue for LeaseQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn enqueue(&self, payload: Vec<u8>) -> Result<Uuid, EnqueueError> {
        self.put(payload, Duration::ZERO)
    }

    async fn enqueue_delayed(
        &self,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<Uuid, EnqueueError> {
        self.put(payload, delay)
    }

    async fn receive(
        &self,
        max_batch: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<Delivery>, ReceiveError> {
        let give_up_at = tokio::time::Instant::now() + wait_timeout;
        loop {
            // Register interest before checking so an enqueue in between is not missed.
            let available = self.available.notified();
            let batch = self.try_receive(max_batch)?;
            let now = tokio::time::Instant::now();
            if !batch.is_empty() || now >= give_up_at {
                return Ok(batch);
            }
            // Lease expiries do not notify, so never sleep past one poll interval.
            let nap = (give_up_at - now).min(self.poll_interval);
            let _ = tokio::time::timeout(nap, available).await;
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<AckOutcome, AckError> {
        self.delete(receipt)
    }
}
