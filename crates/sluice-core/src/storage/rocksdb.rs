use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use serde::de::DeserializeOwned;

use crate::error::{StorageError, StorageResult};
use crate::message::{DeadLetter, Message};
use crate::queue::QueueConfig;
use crate::storage::traits::{Storage, WriteBatchOp};

const CF_MESSAGES: &str = "messages";
const CF_DEAD_LETTERS: &str = "dead_letters";
const CF_QUEUES: &str = "queues";
const CF_STATE: &str = "state";

/// All column family names (excluding `default` which RocksDB creates automatically).
const COLUMN_FAMILIES: &[&str] = &[CF_MESSAGES, CF_DEAD_LETTERS, CF_QUEUES, CF_STATE];

type DB = DBWithThreadMode<MultiThreaded>;

/// RocksDB-backed storage implementation.
pub struct RocksDbStorage {
    db: DB,
}

impl RocksDbStorage {
    /// Open or create a RocksDB database at the given path with all column families.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> StorageResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::RocksDb(format!("column family not found: {name}")))
    }

    fn scan_prefix<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        prefix: &[u8],
    ) -> StorageResult<Vec<(Vec<u8>, T)>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        let mut results = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_vec(), serde_json::from_slice(&value)?));
        }
        Ok(results)
    }
}

impl Storage for RocksDbStorage {
    fn put_message(&self, key: &[u8], message: &Message) -> StorageResult<()> {
        let cf = self.cf(CF_MESSAGES)?;
        let value = serde_json::to_vec(message)?;
        self.db.put_cf(&cf, key, &value)?;
        Ok(())
    }

    fn get_message(&self, key: &[u8]) -> StorageResult<Option<Message>> {
        let cf = self.cf(CF_MESSAGES)?;
        match self.db.get_cf(&cf, key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn list_messages(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Message)>> {
        self.scan_prefix(CF_MESSAGES, prefix)
    }

    fn list_dead_letters(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, DeadLetter)>> {
        self.scan_prefix(CF_DEAD_LETTERS, prefix)
    }

    fn put_queue(&self, queue_id: &str, config: &QueueConfig) -> StorageResult<()> {
        let cf = self.cf(CF_QUEUES)?;
        let value = serde_json::to_vec(config)?;
        self.db.put_cf(&cf, queue_id.as_bytes(), &value)?;
        Ok(())
    }

    fn get_queue(&self, queue_id: &str) -> StorageResult<Option<QueueConfig>> {
        let cf = self.cf(CF_QUEUES)?;
        match self.db.get_cf(&cf, queue_id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn list_queues(&self) -> StorageResult<Vec<QueueConfig>> {
        Ok(self
            .scan_prefix::<QueueConfig>(CF_QUEUES, &[])?
            .into_iter()
            .map(|(_, config)| config)
            .collect())
    }

    fn get_state(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_STATE)?;
        Ok(self.db.get_cf(&cf, key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        let mut batch = WriteBatch::default();

        for op in ops {
            match op {
                WriteBatchOp::PutMessage { key, value } => {
                    batch.put_cf(&self.cf(CF_MESSAGES)?, &key, &value);
                }
                WriteBatchOp::DeleteMessage { key } => {
                    batch.delete_cf(&self.cf(CF_MESSAGES)?, &key);
                }
                WriteBatchOp::PutDeadLetter { key, value } => {
                    batch.put_cf(&self.cf(CF_DEAD_LETTERS)?, &key, &value);
                }
                WriteBatchOp::DeleteDeadLetter { key } => {
                    batch.delete_cf(&self.cf(CF_DEAD_LETTERS)?, &key);
                }
                WriteBatchOp::PutState { key, value } => {
                    batch.put_cf(&self.cf(CF_STATE)?, key.as_bytes(), &value);
                }
            }
        }

        self.db.write(batch)?;
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush_wal(true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::keys;
    use uuid::Uuid;

    fn test_storage() -> (RocksDbStorage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksDbStorage::open(dir.path()).unwrap();
        (storage, dir)
    }

    #[test]
    fn open_creates_all_column_families() {
        let (storage, _dir) = test_storage();
        for cf_name in COLUMN_FAMILIES {
            assert!(
                storage.db.cf_handle(cf_name).is_some(),
                "column family '{cf_name}' should exist"
            );
        }
    }

    #[test]
    fn message_put_get_and_batch_delete() {
        let (storage, _dir) = test_storage();
        let msg = Message::new("q1", vec![1, 2, 3], 1_000_000_000);
        let key = keys::message_key(&msg.queue_id, msg.enqueued_at, &msg.id).unwrap();

        storage.put_message(&key, &msg).unwrap();
        assert_eq!(storage.get_message(&key).unwrap().unwrap(), msg);

        storage
            .write_batch(vec![WriteBatchOp::DeleteMessage { key: key.clone() }])
            .unwrap();
        assert!(storage.get_message(&key).unwrap().is_none());
    }

    #[test]
    fn list_messages_respects_queue_prefix() {
        let (storage, _dir) = test_storage();
        for (queue, ts) in [("a", 3), ("a", 1), ("b", 2)] {
            let msg = Message::new(queue, vec![], ts);
            let key = keys::message_key(queue, ts, &msg.id).unwrap();
            storage.put_message(&key, &msg).unwrap();
        }

        let listed = storage
            .list_messages(&keys::queue_prefix("a").unwrap())
            .unwrap();
        let times: Vec<u64> = listed.iter().map(|(_, m)| m.enqueued_at).collect();
        assert_eq!(times, vec![1, 3]);
    }

    #[test]
    fn write_batch_moves_message_to_dead_letters_atomically() {
        let (storage, _dir) = test_storage();
        let msg = Message::new("q", b"poison".to_vec(), 5);
        let msg_key = keys::message_key("q", 5, &msg.id).unwrap();
        storage.put_message(&msg_key, &msg).unwrap();

        let dead = DeadLetter {
            message: msg.clone(),
            source_queue: "q".to_string(),
            reason: "test".to_string(),
            dead_lettered_at: 10,
        };
        let dl_key = keys::dead_letter_key("q.dlq", 10, &msg.id).unwrap();
        storage
            .write_batch(vec![
                WriteBatchOp::DeleteMessage { key: msg_key.clone() },
                WriteBatchOp::PutDeadLetter {
                    key: dl_key,
                    value: serde_json::to_vec(&dead).unwrap(),
                },
            ])
            .unwrap();

        assert!(storage.get_message(&msg_key).unwrap().is_none());
        let letters = storage
            .list_dead_letters(&keys::queue_prefix("q.dlq").unwrap())
            .unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].1, dead);
    }

    #[test]
    fn queue_configs_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = RocksDbStorage::open(dir.path()).unwrap();
            storage
                .put_queue("scraper-queue", &QueueConfig::new("scraper-queue"))
                .unwrap();
            storage.flush().unwrap();
        }
        let storage = RocksDbStorage::open(dir.path()).unwrap();
        let queues = storage.list_queues().unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].name, "scraper-queue");
        assert!(storage.get_queue("missing").unwrap().is_none());
    }

    #[test]
    fn state_written_through_batch_is_readable() {
        let (storage, _dir) = test_storage();
        storage
            .write_batch(vec![WriteBatchOp::PutState {
                key: "result:bill-1".to_string(),
                value: b"{}".to_vec(),
            }])
            .unwrap();
        assert_eq!(
            storage.get_state("result:bill-1").unwrap(),
            Some(b"{}".to_vec())
        );
        let id = Uuid::now_v7();
        assert!(storage.get_state(&id.to_string()).unwrap().is_none());
    }
}
