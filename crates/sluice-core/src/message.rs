use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReceiptParseError;

/// Core message domain type as stored by a queue.
///
/// `id` is stable across redeliveries. `receipt` is regenerated on every
/// delivery and is what a consumer presents to acknowledge; a message whose
/// `receipt` no longer matches the presented handle has been re-leased.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub queue_id: String,
    pub payload: Vec<u8>,
    pub enqueued_at: u64,
    pub delivery_count: u32,
    /// Message is invisible until this instant (ns). `None` means visible.
    pub visibility_deadline: Option<u64>,
    /// Nonce of the current lease, if the message has ever been delivered.
    pub receipt: Option<Uuid>,
}

impl Message {
    /// Generate a new UUIDv7 message ID.
    pub fn new_id() -> Uuid {
        Uuid::now_v7()
    }

    pub fn new(queue_id: &str, payload: Vec<u8>, enqueued_at: u64) -> Self {
        Self {
            id: Self::new_id(),
            queue_id: queue_id.to_string(),
            payload,
            enqueued_at,
            delivery_count: 0,
            visibility_deadline: None,
            receipt: None,
        }
    }

    pub fn is_visible(&self, now_ns: u64) -> bool {
        self.visibility_deadline.is_none_or(|deadline| deadline <= now_ns)
    }

    /// Leased and the lease has not yet expired.
    pub fn is_in_flight(&self, now_ns: u64) -> bool {
        self.receipt.is_some() && !self.is_visible(now_ns)
    }
}

/// Opaque handle for one delivery of one message.
///
/// The string form is `{queue_id}:{enqueued_at}:{message_id}:{nonce}`. Queue
/// names may contain `:`, so parsing splits from the right.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle {
    pub queue_id: String,
    pub enqueued_at: u64,
    pub message_id: Uuid,
    pub nonce: Uuid,
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.queue_id, self.enqueued_at, self.message_id, self.nonce
        )
    }
}

impl FromStr for ReceiptHandle {
    type Err = ReceiptParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReceiptParseError(s.to_string());
        let mut parts = s.rsplitn(4, ':');
        let nonce = parts.next().ok_or_else(invalid)?;
        let message_id = parts.next().ok_or_else(invalid)?;
        let enqueued_at = parts.next().ok_or_else(invalid)?;
        let queue_id = parts.next().filter(|q| !q.is_empty()).ok_or_else(invalid)?;

        Ok(Self {
            queue_id: queue_id.to_string(),
            enqueued_at: enqueued_at.parse().map_err(|_| invalid())?,
            message_id: message_id.parse().map_err(|_| invalid())?,
            nonce: nonce.parse().map_err(|_| invalid())?,
        })
    }
}

/// One message handed to a consumer by `receive`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: Uuid,
    pub receipt: ReceiptHandle,
    pub payload: Vec<u8>,
    pub delivery_count: u32,
    pub enqueued_at: u64,
}

/// A message relocated to a dead-letter queue. Never redelivered
/// automatically; only an explicit redrive puts it back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub message: Message,
    pub source_queue: String,
    pub reason: String,
    pub dead_lettered_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_handle_round_trips_queue_names_with_colons() {
        let handle = ReceiptHandle {
            queue_id: "team:scraper-queue".to_string(),
            enqueued_at: 1_700_000_000_000,
            message_id: Uuid::now_v7(),
            nonce: Uuid::now_v7(),
        };
        let parsed: ReceiptHandle = handle.to_string().parse().unwrap();
        assert_eq!(parsed, handle);
    }

    #[test]
    fn receipt_handle_rejects_garbage() {
        assert!("nope".parse::<ReceiptHandle>().is_err());
        assert!(":1:2:3".parse::<ReceiptHandle>().is_err());
        let bad_ts = format!("q:abc:{}:{}", Uuid::now_v7(), Uuid::now_v7());
        assert!(bad_ts.parse::<ReceiptHandle>().is_err());
    }

    #[test]
    fn visibility_follows_deadline() {
        let mut msg = Message::new("q", vec![1], 10);
        assert!(msg.is_visible(0));
        assert!(!msg.is_in_flight(0));

        msg.visibility_deadline = Some(100);
        msg.receipt = Some(Uuid::now_v7());
        assert!(!msg.is_visible(99));
        assert!(msg.is_in_flight(99));
        assert!(msg.is_visible(100));
        assert!(!msg.is_in_flight(100));
    }
}
