pub(crate) mod keys;
mod memory;
mod rocksdb;
mod traits;

pub use self::memory::MemoryStorage;
pub use self::rocksdb::RocksDbStorage;
pub use traits::{Storage, WriteBatchOp};
