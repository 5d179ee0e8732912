pub mod alert;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod schedule;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use alert::{AlertSink, Signal, SignalSender};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PipelineConfig, StageEnv};
pub use envelope::Envelope;
pub use error::{StorageError, StorageResult};
pub use message::{DeadLetter, Delivery, Message, ReceiptHandle};
pub use metrics::Metrics;
pub use queue::{AckOutcome, LeaseQueue, Queue, QueueConfig, QueueStats};
pub use schedule::{ScheduleRule, Scheduler};
pub use storage::{MemoryStorage, RocksDbStorage, Storage, WriteBatchOp};
pub use worker::{NlpStage, ScraperStage, Worker, WorkerPool};
