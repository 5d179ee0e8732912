//! The producer/consumer contract and its lease-based implementation.

mod dead_letter;
mod lease;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AckError, ConfigError, EnqueueError, ReceiveError};
use crate::message::{Delivery, ReceiptHandle};

pub use lease::LeaseQueue;

/// Queue configuration, persisted in the `queues` column family so operator
/// tools can reopen a queue with the settings it was created with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    pub visibility_timeout_ms: u64,
    /// Deliveries allowed before the next receive dead-letters the message.
    pub max_receive_count: u32,
    /// `None` disables dead-lettering; messages then retry forever.
    pub dead_letter_queue: Option<String>,
    pub dead_letter_retention_ms: u64,
    pub max_payload_bytes: usize,
}

impl QueueConfig {
    /// Default visibility timeout: 30 seconds.
    pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;
    /// Dead letters are kept for 14 days.
    pub const DEFAULT_DEAD_LETTER_RETENTION_MS: u64 = 14 * 24 * 60 * 60 * 1000;
    pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

    /// A queue named `X` dead-letters into `X.dlq`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            visibility_timeout_ms: Self::DEFAULT_VISIBILITY_TIMEOUT_MS,
            max_receive_count: Self::DEFAULT_MAX_RECEIVE_COUNT,
            dead_letter_queue: Some(format!("{name}.dlq")),
            dead_letter_retention_ms: Self::DEFAULT_DEAD_LETTER_RETENTION_MS,
            max_payload_bytes: Self::DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = count;
        self
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("queue name must not be empty".into()));
        }
        if self.visibility_timeout_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "queue {}: visibility_timeout_ms must be positive",
                self.name
            )));
        }
        if self.max_receive_count == 0 {
            return Err(ConfigError::Invalid(format!(
                "queue {}: max_receive_count must be at least 1",
                self.name
            )));
        }
        if self.dead_letter_queue.as_deref() == Some(self.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "queue {} cannot dead-letter into itself",
                self.name
            )));
        }
        Ok(())
    }
}

/// Result of presenting a receipt handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The message was removed permanently.
    Deleted,
    /// The receipt no longer owns the message: it was re-leased by another
    /// consumer, already acknowledged, or dead-lettered. Nothing changed.
    Stale,
}

/// Point-in-time counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub visible: u64,
    pub in_flight: u64,
    pub delayed: u64,
    pub dead_letters: u64,
}

impl QueueStats {
    pub fn depth(&self) -> u64 {
        self.visible + self.in_flight + self.delayed
    }
}

/// At-least-once queue contract shared by every stage.
///
/// Implementations guarantee that no two concurrent `receive` calls return the
/// same message while its lease is active, and that every state transition of
/// a message is atomic. They do not guarantee ordering or exactly-once
/// delivery; consumers must be idempotent.
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    /// Store a payload atomically and return its stable message id.
    fn enqueue(&self, payload: Vec<u8>) -> impl Future<Output = Result<Uuid, EnqueueError>> + Send;

    /// Store a payload that stays invisible for `delay`.
    fn enqueue_delayed(
        &self,
        payload: Vec<u8>,
        delay: Duration,
    ) -> impl Future<Output = Result<Uuid, EnqueueError>> + Send;

    /// Lease up to `max_batch` visible messages, waiting up to `wait_timeout`
    /// for one to become available. An empty result is not an error.
    fn receive(
        &self,
        max_batch: usize,
        wait_timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Delivery>, ReceiveError>> + Send;

    /// Permanently remove the message leased under `receipt`.
    fn acknowledge(
        &self,
        receipt: &ReceiptHandle,
    ) -> impl Future<Output = Result<AckOutcome, AckError>> + Send;
}
