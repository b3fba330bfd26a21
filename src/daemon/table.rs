//! Per-key table of live write state machines.
//!
//! Entries are created on demand and handed out as shared handles; a
//! machine is reclaimed only once it reports idle and nothing outside the
//! table holds a handle. Handlers keep their handle for the duration of one
//! message, so the strong count doubles as the reference count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::wsm::WriteStateMachine;

#[derive(Default)]
pub struct WriteTable {
    entries: Mutex<HashMap<Bytes, Arc<WriteStateMachine>>>,
}

impl WriteTable {
    pub fn new() -> WriteTable {
        WriteTable::default()
    }

    pub fn get_or_create(&self, key: &Bytes) -> Arc<WriteStateMachine> {
        let mut entries = self.entries.lock().expect("write table poisoned");
        entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(WriteStateMachine::new(key.clone())))
            .clone()
    }

    /// Handles to every live machine, for the re-drive sweep.
    pub fn snapshot(&self) -> Vec<Arc<WriteStateMachine>> {
        let entries = self.entries.lock().expect("write table poisoned");
        entries.values().cloned().collect()
    }

    /// Drop machines that are idle and unreferenced. Holding the table lock
    /// here excludes a concurrent `get_or_create`, so "unreferenced" cannot
    /// go stale mid-reap.
    pub fn reap_idle(&self) {
        let mut entries = self.entries.lock().expect("write table poisoned");
        entries.retain(|_, machine| Arc::strong_count(machine) > 1 || !machine.finished());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("write table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
