use std::path::PathBuf;
use std::time::Duration;

/// Low-level storage errors (RocksDB, serialization).
/// Every per-operation error below embeds this via `#[from]`; storage can only
/// fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    RocksDb(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("queue state lock poisoned")]
    LockPoisoned,
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::RocksDb(err.into_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

// --- Per-operation error types ---

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("batch size must be between 1 and {max}, got {requested}")]
    InvalidBatchSize { requested: usize, max: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("receipt belongs to queue {receipt_queue}, not {queue}")]
    WrongQueue { queue: String, receipt_queue: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A receipt handle string that does not have the `queue:ts:id:nonce` shape.
#[derive(Debug, thiserror::Error)]
#[error("invalid receipt handle: {0}")]
pub struct ReceiptParseError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("queue {0} has no dead-letter queue configured")]
    NoDeadLetterQueue(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("no target queue registered under {0}")]
    UnknownTarget(String),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

/// Errors raised while loading or validating configuration. All of these are
/// fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("error parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("queue not found: {0}")]
    UnknownQueue(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure of a stage processor on one message. Any variant leaves the
/// message unacknowledged so the queue redelivers it.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("malformed envelope: {0}")]
    InvalidEnvelope(String),

    #[error("processing exceeded {0:?}")]
    Timeout(Duration),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("downstream enqueue failed: {0}")]
    Downstream(#[from] EnqueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors that stop a worker loop. Processing failures never do; they are
/// left to redelivery.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("receive failed: {0}")]
    Receive(#[from] ReceiveError),

    #[error("acknowledge failed: {0}")]
    Ack(#[from] AckError),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
