//! Durable map: the ordered byte-keyed store the acceptor and learner
//! persist through.
//!
//! The contract is deliberately narrow: point get, synchronous put, and a
//! first-class "not found". Synchronous means the put has reached stable
//! storage before the call returns; the promise an acceptor hands out must
//! survive a crash.

mod sqlite;

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;

pub use sqlite::SqliteMap;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub trait DurableMap: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`, replacing any prior value, durably.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
}

/// In-memory stand-in for tests and the in-process cluster harness.
#[derive(Default)]
pub struct MemoryMap {
    slots: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryMap {
    pub fn new() -> MemoryMap {
        MemoryMap::default()
    }
}

impl DurableMap for MemoryMap {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.slots.lock().expect("slot map poisoned").get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.slots
            .lock()
            .expect("slot map poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}
