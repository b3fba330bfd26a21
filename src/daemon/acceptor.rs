//! Acceptor role: stateless in memory, durable in the slot store.
//!
//! The acceptor record for key `k` lives at `k‖'A'` as
//! `version ‖ promised ballot ‖ accepted pvalue` in the wire layout. Loading
//! folds in the learned record: once the decree at the recorded version has
//! been learned locally, the acceptor implicitly advances to the next
//! version with a clean promise, which is how a replica joins decree `n+1`
//! without any explicit message.

use bytes::Bytes;
use thiserror::Error;

use super::learner;
use super::Daemon;
use crate::core::types::{Ballot, HostId, PValue};
use crate::core::wire::{Message, Reader, WireError, Writer};
use crate::storage::{DurableMap, StorageError};

const ACCEPTOR_SUFFIX: u8 = b'A';
pub(crate) const LEARNED_SUFFIX: u8 = b'L';

pub(crate) fn slot_key(key: &[u8], suffix: u8) -> Vec<u8> {
    let mut slot = Vec::with_capacity(key.len() + 1);
    slot.extend_from_slice(key);
    slot.push(suffix);
    slot
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AcceptorState {
    pub version: u64,
    pub promised: Ballot,
    pub accepted: PValue,
}

#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("corrupt acceptor record: {0}")]
    Corrupt(#[from] WireError),
}

pub fn load(store: &dyn DurableMap, key: &[u8]) -> Result<AcceptorState, AcceptorError> {
    let raw = match store.get(&slot_key(key, ACCEPTOR_SUFFIX))? {
        Some(raw) => raw,
        None => return Ok(AcceptorState::default()),
    };
    let mut reader = Reader::new(&raw);
    let mut state = AcceptorState {
        version: reader.u64()?,
        promised: reader.ballot()?,
        accepted: reader.pvalue()?,
    };

    if let Some(record) = store.get(&slot_key(key, LEARNED_SUFFIX))? {
        if learner::record_version(&record) == Some(state.version) {
            state.version += 1;
            state.promised = Ballot::ZERO;
            state.accepted = PValue::default();
        }
    }
    Ok(state)
}

/// Synchronously persist the acceptor record; must not return before the
/// promise is on stable storage.
pub fn save(
    store: &dyn DurableMap,
    key: &[u8],
    version: u64,
    promised: Ballot,
    accepted: &PValue,
) -> Result<(), StorageError> {
    let mut writer = Writer::new();
    writer.u64(version);
    writer.ballot(promised);
    writer.pvalue(accepted);
    store.put(&slot_key(key, ACCEPTOR_SUFFIX), &writer.into_vec())
}

/// Phase-1a from `c`: promise iff the sender names itself as leader, the
/// ballot outbids our promise, and the version is current. Either way the
/// reply reports where this acceptor actually stands.
pub fn phase1a(d: &Daemon, c: HostId, key: &Bytes, version: u64, ballot: Ballot) {
    let _slot = d.lock_slot(key);
    let mut state = match load(d.store(), key) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "could not load acceptor state");
            return;
        }
    };

    if c == ballot.leader && ballot > state.promised && version >= state.version {
        state.version = version;
        state.promised = ballot;
        if let Err(err) = save(d.store(), key, state.version, state.promised, &state.accepted) {
            tracing::error!(error = %err, "could not save acceptor state");
            return;
        }
    }

    d.send_message(
        c,
        &Message::Phase1b {
            key: key.clone(),
            version: state.version,
            ballot: state.promised,
            accepted: state.accepted,
        },
    );
}

/// Phase-2a from `c`: accept only the exact round we promised; anything
/// else tells the proposer to abandon and retry.
pub fn phase2a(d: &Daemon, c: HostId, key: &Bytes, version: u64, ballot: Ballot, pvalue: PValue) {
    let _slot = d.lock_slot(key);
    let state = match load(d.store(), key) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "could not load acceptor state");
            return;
        }
    };

    if version == state.version && ballot == state.promised {
        if let Err(err) = save(d.store(), key, version, ballot, &pvalue) {
            tracing::error!(error = %err, "could not save acceptor state");
            return;
        }
        d.send_message(
            c,
            &Message::Phase2b {
                key: key.clone(),
                version,
                ballot,
            },
        );
    } else {
        d.send_message(c, &Message::Retry { key: key.clone() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryMap;

    fn ballot(number: u64, leader: HostId) -> Ballot {
        Ballot { number, leader }
    }

    #[test]
    fn fresh_keys_load_the_initial_state() {
        let store = MemoryMap::new();
        let state = load(&store, b"k").unwrap();
        assert_eq!(state, AcceptorState::default());
        assert_eq!(state.version, 0);
        assert!(state.promised.is_zero());
    }

    #[test]
    fn records_round_trip_through_the_store() {
        let store = MemoryMap::new();
        let promised = ballot(7, HostId::C);
        let accepted = PValue {
            ballot: ballot(5, HostId::B),
            value: Bytes::from_static(b"v"),
        };
        save(&store, b"k", 3, promised, &accepted).unwrap();

        let state = load(&store, b"k").unwrap();
        assert_eq!(state.version, 3);
        assert_eq!(state.promised, promised);
        assert_eq!(state.accepted, accepted);
    }

    #[test]
    fn load_advances_past_a_locally_learned_decree() {
        let store = MemoryMap::new();
        let promised = ballot(7, HostId::C);
        let accepted = PValue {
            ballot: promised,
            value: Bytes::from_static(b"chosen"),
        };
        save(&store, b"k", 3, promised, &accepted).unwrap();

        // Learned record for version 3: value then the big-endian version.
        let mut record = b"chosen".to_vec();
        record.extend_from_slice(&3u64.to_be_bytes());
        store.put(&slot_key(b"k", LEARNED_SUFFIX), &record).unwrap();

        let state = load(&store, b"k").unwrap();
        assert_eq!(state.version, 4, "closed decree folds to the next version");
        assert!(state.promised.is_zero());
        assert!(state.accepted.is_zero());
    }

    #[test]
    fn load_does_not_advance_before_anything_is_learned() {
        let store = MemoryMap::new();
        save(&store, b"k", 0, ballot(7, HostId::A), &PValue::default()).unwrap();

        let state = load(&store, b"k").unwrap();
        assert_eq!(state.version, 0, "an open decree keeps its version");
        assert_eq!(state.promised, ballot(7, HostId::A));
    }

    #[test]
    fn load_keeps_the_version_when_the_learned_decree_is_older() {
        let store = MemoryMap::new();
        save(&store, b"k", 5, ballot(9, HostId::D), &PValue::default()).unwrap();

        let mut record = b"old".to_vec();
        record.extend_from_slice(&2u64.to_be_bytes());
        store.put(&slot_key(b"k", LEARNED_SUFFIX), &record).unwrap();

        let state = load(&store, b"k").unwrap();
        assert_eq!(state.version, 5);
        assert_eq!(state.promised, ballot(9, HostId::D));
    }

    #[test]
    fn corrupt_records_are_an_error_not_a_reset() {
        let store = MemoryMap::new();
        store.put(&slot_key(b"k", ACCEPTOR_SUFFIX), &[1, 2, 3]).unwrap();
        assert!(matches!(
            load(&store, b"k").unwrap_err(),
            AcceptorError::Corrupt(_)
        ));
    }
}
