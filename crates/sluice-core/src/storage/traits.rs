use crate::error::StorageResult;
use crate::message::{DeadLetter, Message};
use crate::queue::QueueConfig;

/// Represents a single operation in an atomic write batch.
#[derive(Debug)]
pub enum WriteBatchOp {
    PutMessage { key: Vec<u8>, value: Vec<u8> },
    DeleteMessage { key: Vec<u8> },
    PutDeadLetter { key: Vec<u8>, value: Vec<u8> },
    DeleteDeadLetter { key: Vec<u8> },
    PutState { key: String, value: Vec<u8> },
}

/// Storage trait for all persistence operations. Implementations must be thread-safe.
pub trait Storage: Send + Sync {
    // --- Message operations ---

    /// Store a message in the messages CF.
    fn put_message(&self, key: &[u8], message: &Message) -> StorageResult<()>;

    /// Retrieve a message by its full key.
    fn get_message(&self, key: &[u8]) -> StorageResult<Option<Message>>;

    /// List messages whose keys start with the given prefix, in lexicographic order.
    fn list_messages(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Message)>>;

    // --- Dead-letter operations ---

    /// List dead letters whose keys start with the given prefix, oldest first.
    fn list_dead_letters(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, DeadLetter)>>;

    // --- Queue operations ---

    /// Store a queue config.
    fn put_queue(&self, queue_id: &str, config: &QueueConfig) -> StorageResult<()>;

    /// Retrieve a queue config by ID.
    fn get_queue(&self, queue_id: &str) -> StorageResult<Option<QueueConfig>>;

    /// List all queue configs.
    fn list_queues(&self) -> StorageResult<Vec<QueueConfig>>;

    // --- State operations ---

    /// Retrieve a state value by key.
    fn get_state(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    // --- Batch operations ---

    /// Atomically apply a batch of write operations across column families.
    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()>;

    /// Flush buffered writes to durable media. No-op for volatile backends.
    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}
