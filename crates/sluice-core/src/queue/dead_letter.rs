//! Dead-letter inspection and operator actions.
//!
//! Relocation normally happens inside `receive`; the methods here cover the
//! explicit paths: a worker giving up on a message, an operator redriving
//! dead letters back into their source queue, and retention purges.

use tracing::info;
use uuid::Uuid;

use super::LeaseQueue;
use crate::error::{DeadLetterError, StorageError};
use crate::message::DeadLetter;
use crate::storage::{keys, WriteBatchOp};

impl LeaseQueue {
    fn dead_letter_queue(&self) -> Result<&str, DeadLetterError> {
        self.config()
            .dead_letter_queue
            .as_deref()
            .ok_or_else(|| DeadLetterError::NoDeadLetterQueue(self.config().name.clone()))
    }

    /// Dead letters that originated in this queue, oldest first.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        let Some(dlq) = self.config().dead_letter_queue.as_deref() else {
            return Ok(Vec::new());
        };
        Ok(self
            .storage()
            .list_dead_letters(&keys::queue_prefix(dlq)?)?
            .into_iter()
            .map(|(_, dead)| dead)
            .filter(|dead| dead.source_queue == self.config().name)
            .collect())
    }

    /// Move one message to the dead-letter queue regardless of its lease.
    ///
    /// Returns `false` when the message is no longer in the queue (already
    /// acknowledged or already relocated), which makes the call idempotent.
    pub fn relocate(&self, message_id: &Uuid, reason: &str) -> Result<bool, DeadLetterError> {
        let dlq = self.dead_letter_queue()?.to_string();
        let prefix = keys::queue_prefix(&self.config().name)?;

        let guard = self.lock()?;
        let found = self
            .storage()
            .list_messages(&prefix)?
            .into_iter()
            .find(|(_, msg)| msg.id == *message_id);
        let Some((key, msg)) = found else {
            return Ok(false);
        };
        let delivery_count = msg.delivery_count;
        let ops = self.relocation_ops(key, msg, &dlq, reason.to_string(), self.now_ns())?;
        self.storage().write_batch(ops)?;
        drop(guard);

        self.after_relocation(message_id, delivery_count);
        Ok(true)
    }

    /// Re-inject up to `count` dead letters (0 means all) into this queue,
    /// oldest first, with a fresh receive budget. Returns how many moved.
    pub fn redrive(&self, count: u64) -> Result<u64, DeadLetterError> {
        let dlq = self.dead_letter_queue()?.to_string();
        let limit = if count == 0 { usize::MAX } else { count as usize };

        let guard = self.lock()?;
        let now = self.now_ns();
        let mut ops = Vec::new();
        let mut moved = 0u64;
        for (dl_key, dead) in self
            .storage()
            .list_dead_letters(&keys::queue_prefix(&dlq)?)?
            .into_iter()
            .filter(|(_, dead)| dead.source_queue == self.config().name)
            .take(limit)
        {
            let mut msg = dead.message;
            msg.delivery_count = 0;
            msg.receipt = None;
            msg.visibility_deadline = None;
            msg.enqueued_at = now;
            let key = keys::message_key(&self.config().name, now, &msg.id)?;
            ops.push(WriteBatchOp::DeleteDeadLetter { key: dl_key });
            ops.push(WriteBatchOp::PutMessage {
                key,
                value: serde_json::to_vec(&msg).map_err(StorageError::from)?,
            });
            moved += 1;
        }
        if !ops.is_empty() {
            self.storage().write_batch(ops)?;
        }
        drop(guard);

        if moved > 0 {
            info!(
                queue = %self.config().name,
                dead_letter_queue = %dlq,
                count = moved,
                "dead letters redriven"
            );
            self.metrics.record_redrive(&self.config().name, moved);
            self.wake_receivers();
        }
        Ok(moved)
    }

    /// Delete every dead letter of this queue, or only those older than the
    /// configured retention when `expired_only` is set. Returns how many went.
    pub fn purge_dead_letters(&self, expired_only: bool) -> Result<u64, DeadLetterError> {
        let dlq = self.dead_letter_queue()?.to_string();
        let retention_ns = self.config().dead_letter_retention_ms.saturating_mul(1_000_000);

        let guard = self.lock()?;
        let cutoff = self.now_ns().saturating_sub(retention_ns);
        let ops: Vec<_> = self
            .storage()
            .list_dead_letters(&keys::queue_prefix(&dlq)?)?
            .into_iter()
            .filter(|(_, dead)| dead.source_queue == self.config().name)
            .filter(|(_, dead)| !expired_only || dead.dead_lettered_at < cutoff)
            .map(|(key, _)| WriteBatchOp::DeleteDeadLetter { key })
            .collect();
        let purged = ops.len() as u64;
        if purged > 0 {
            self.storage().write_batch(ops)?;
        }
        drop(guard);

        if purged > 0 {
            info!(
                queue = %self.config().name,
                dead_letter_queue = %dlq,
                count = purged,
                expired_only,
                "dead letters purged"
            );
        }
        Ok(purged)
    }

    /// Drop dead letters older than the retention period.
    pub fn purge_expired_dead_letters(&self) -> Result<u64, DeadLetterError> {
        self.purge_dead_letters(true)
    }
}
