//! Key encoding for the storage column families.
//!
//! All numeric values use big-endian encoding for correct lexicographic ordering.
//! Composite keys use `:` (0x3A) as separator.
//! Variable-length strings are length-prefixed with a big-endian u16.

use uuid::Uuid;

use crate::error::{StorageError, StorageResult};

const SEPARATOR: u8 = b':';

/// Encode a u64 as 8 big-endian bytes.
fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Encode a variable-length string with a 2-byte big-endian length prefix.
fn encode_string(s: &str) -> StorageResult<Vec<u8>> {
    let len = u16::try_from(s.len())
        .map_err(|_| StorageError::CorruptData(format!("key string exceeds 64 KiB: {s:.32}")))?;
    let mut buf = Vec::with_capacity(2 + s.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(buf)
}

/// `{queue_id}:{ts_ns}:{msg_id}`, shared by the messages and dead_letters CFs.
fn timestamped_key(queue_id: &str, ts_ns: u64, msg_id: &Uuid) -> StorageResult<Vec<u8>> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(&encode_string(queue_id)?);
    key.push(SEPARATOR);
    key.extend_from_slice(&encode_u64(ts_ns));
    key.push(SEPARATOR);
    key.extend_from_slice(msg_id.as_bytes());
    Ok(key)
}

/// Build a message key: `{queue_id}:{enqueue_ts_ns}:{msg_id}`
///
/// Messages of one queue sort by enqueue time, then by UUIDv7, which gives
/// best-effort FIFO on a prefix scan.
pub fn message_key(queue_id: &str, enqueue_ts_ns: u64, msg_id: &Uuid) -> StorageResult<Vec<u8>> {
    timestamped_key(queue_id, enqueue_ts_ns, msg_id)
}

/// Build a prefix for iterating all messages in a queue.
pub fn queue_prefix(queue_id: &str) -> StorageResult<Vec<u8>> {
    let mut prefix = encode_string(queue_id)?;
    prefix.push(SEPARATOR);
    Ok(prefix)
}

/// Build a dead-letter key: `{dlq_id}:{dead_lettered_at_ns}:{msg_id}`
///
/// Ordered by arrival in the dead-letter queue so retention purges and
/// redrives walk oldest first.
pub fn dead_letter_key(
    dlq_id: &str,
    dead_lettered_at_ns: u64,
    msg_id: &Uuid,
) -> StorageResult<Vec<u8>> {
    timestamped_key(dlq_id, dead_lettered_at_ns, msg_id)
}

/// Key for a stored stage result in the state CF.
pub fn result_key(natural_key: &str) -> String {
    format!("result:{natural_key}")
}
