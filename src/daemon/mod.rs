//! The replica daemon: process-wide context and message dispatch.
//!
//! One `Daemon` is the whole of a replica's shared state: identity,
//! transport, durable map, and the per-key write table. Proposer, acceptor,
//! and learner are not objects; they are the handlers below plus, for the
//! proposer, a per-key machine. Handlers receive the context explicitly.

pub mod acceptor;
pub mod learner;
pub mod run;
mod table;
mod wsm;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::types::{HostId, ReturnCode};
use crate::core::wire::{self, Message};
use crate::net::Transport;
use crate::storage::DurableMap;

pub use acceptor::{AcceptorError, AcceptorState};
pub use run::{run, DaemonError};
pub use table::WriteTable;
pub use wsm::WriteStateMachine;

const SLOT_STRIPES: usize = 64;

pub struct Daemon {
    host: HostId,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DurableMap>,
    writes: WriteTable,
    slot_locks: Vec<Mutex<()>>,
}

impl Daemon {
    pub fn new(
        host: HostId,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DurableMap>,
    ) -> Daemon {
        Daemon {
            host,
            transport,
            store,
            writes: WriteTable::new(),
            slot_locks: (0..SLOT_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn store(&self) -> &dyn DurableMap {
        self.store.as_ref()
    }

    pub fn writes(&self) -> &WriteTable {
        &self.writes
    }

    /// Serializes read-modify-write cycles on one key's durable slots.
    /// Handlers for different keys run in parallel, so the acceptor's
    /// load-check-store and the learner's version guard must exclude each
    /// other per key. The read path takes no lock; a get sees whichever
    /// learned record is current.
    pub(crate) fn lock_slot(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = hasher.finish() as usize % SLOT_STRIPES;
        self.slot_locks[stripe].lock().expect("slot lock poisoned")
    }

    /// Decode one inbound payload and route it. Undecodable input is logged
    /// and dropped; the dispatcher never dies on bad bytes. `from` is the
    /// transport's claim about the sender and is not authenticated.
    pub fn dispatch(&self, from: HostId, payload: &[u8]) {
        let msg = match wire::decode_message(payload) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(from = %from, error = %err, "dropping undecodable message");
                return;
            }
        };

        match msg {
            Message::Put { key, value } => {
                let machine = self.writes.get_or_create(&key);
                machine.write(from, value, self);
            }
            Message::Get { key } => learner::get(self, from, &key),
            Message::Phase1a {
                key,
                version,
                ballot,
            } => acceptor::phase1a(self, from, &key, version, ballot),
            Message::Phase1b {
                key,
                version,
                ballot,
                accepted,
            } => {
                let machine = self.writes.get_or_create(&key);
                machine.phase1b(from, version, ballot, accepted, self);
            }
            Message::Phase2a {
                key,
                version,
                ballot,
                pvalue,
            } => acceptor::phase2a(self, from, &key, version, ballot, pvalue),
            Message::Phase2b {
                key,
                version,
                ballot,
            } => {
                let machine = self.writes.get_or_create(&key);
                machine.phase2b(from, version, ballot, self);
            }
            Message::Learn {
                key,
                version,
                value,
            } => learner::learn(self, &key, version, &value),
            Message::Retry { key } => {
                let machine = self.writes.get_or_create(&key);
                machine.retry(self);
            }
        }
    }

    /// One sweep of the re-drive loop: kick every live machine, then drop
    /// the ones that went idle.
    pub fn sweep(&self) {
        for machine in self.writes.snapshot() {
            machine.poke(self);
        }
        self.writes.reap_idle();
    }

    pub(crate) fn send_message(&self, dst: HostId, msg: &Message) {
        if let Err(err) = self.transport.send(dst, &wire::encode_message(msg)) {
            tracing::warn!(dst = %dst, tag = %(msg.tag() as char), error = %err, "send failed");
        }
    }

    pub(crate) fn send_put_reply(&self, dst: HostId, rc: ReturnCode) {
        if let Err(err) = self.transport.send(dst, &wire::encode_put_reply(rc)) {
            tracing::warn!(dst = %dst, error = %err, "put reply failed");
        }
    }

    pub(crate) fn send_get_reply(&self, dst: HostId, rc: ReturnCode, value: &[u8]) {
        if let Err(err) = self
            .transport
            .send(dst, &wire::encode_get_reply(rc, value))
        {
            tracing::warn!(dst = %dst, error = %err, "get reply failed");
        }
    }
}
