use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;

use crate::error::{StorageError, StorageResult};
use crate::message::{DeadLetter, Message};
use crate::queue::QueueConfig;
use crate::storage::traits::{Storage, WriteBatchOp};

#[derive(Default)]
struct Tables {
    messages: BTreeMap<Vec<u8>, Vec<u8>>,
    dead_letters: BTreeMap<Vec<u8>, Vec<u8>>,
    queues: BTreeMap<String, Vec<u8>>,
    state: BTreeMap<String, Vec<u8>>,
}

/// Volatile storage with the same ordering and batch semantics as
/// [`RocksDbStorage`](super::RocksDbStorage). Values are kept serialized so
/// both backends exercise the same encode/decode path.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

fn scan<T: DeserializeOwned>(
    table: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
) -> StorageResult<Vec<(Vec<u8>, T)>> {
    table
        .range(prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| Ok((key.clone(), serde_json::from_slice(value)?)))
        .collect()
}

impl Storage for MemoryStorage {
    fn put_message(&self, key: &[u8], message: &Message) -> StorageResult<()> {
        let value = serde_json::to_vec(message)?;
        self.tables()?.messages.insert(key.to_vec(), value);
        Ok(())
    }

    fn get_message(&self, key: &[u8]) -> StorageResult<Option<Message>> {
        match self.tables()?.messages.get(key) {
            Some(value) => Ok(Some(serde_json::from_slice(value)?)),
            None => Ok(None),
        }
    }

    fn list_messages(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Message)>> {
        scan(&self.tables()?.messages, prefix)
    }

    fn list_dead_letters(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, DeadLetter)>> {
        scan(&self.tables()?.dead_letters, prefix)
    }

    fn put_queue(&self, queue_id: &str, config: &QueueConfig) -> StorageResult<()> {
        let value = serde_json::to_vec(config)?;
        self.tables()?.queues.insert(queue_id.to_string(), value);
        Ok(())
    }

    fn get_queue(&self, queue_id: &str) -> StorageResult<Option<QueueConfig>> {
        match self.tables()?.queues.get(queue_id) {
            Some(value) => Ok(Some(serde_json::from_slice(value)?)),
            None => Ok(None),
        }
    }

    fn list_queues(&self) -> StorageResult<Vec<QueueConfig>> {
        self.tables()?
            .queues
            .values()
            .map(|value| Ok(serde_json::from_slice(value)?))
            .collect()
    }

    fn get_state(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.tables()?.state.get(key).cloned())
    }

    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        // One guard for the whole batch: readers never see a partial batch.
        let mut tables = self.tables()?;
        for op in ops {
            match op {
                WriteBatchOp::PutMessage { key, value } => {
                    tables.messages.insert(key, value);
                }
                WriteBatchOp::DeleteMessage { key } => {
                    tables.messages.remove(&key);
                }
                WriteBatchOp::PutDeadLetter { key, value } => {
                    tables.dead_letters.insert(key, value);
                }
                WriteBatchOp::DeleteDeadLetter { key } => {
                    tables.dead_letters.remove(&key);
                }
                WriteBatchOp::PutState { key, value } => {
                    tables.state.insert(key, value);
                }
            }
        }
        Ok(())
    }
}
