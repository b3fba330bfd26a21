//! Learner role and the read path.
//!
//! The learned record for key `k` lives at `k‖'L'` as the raw value bytes
//! followed by the big-endian version of the decree that produced it. The
//! suffix is what lets the acceptor detect a closed decree, and the guard
//! against older versions keeps a delayed learn from rolling the record
//! back.

use super::acceptor::{slot_key, LEARNED_SUFFIX};
use super::Daemon;
use crate::core::types::{HostId, ReturnCode};

/// Version suffix of a learned record, if the record is well-formed.
pub(crate) fn record_version(record: &[u8]) -> Option<u64> {
    if record.len() < 8 {
        return None;
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&record[record.len() - 8..]);
    Some(u64::from_be_bytes(word))
}

pub fn learn(d: &Daemon, key: &[u8], version: u64, value: &[u8]) {
    let _slot_lock = d.lock_slot(key);
    let slot = slot_key(key, LEARNED_SUFFIX);
    match d.store().get(&slot) {
        Ok(Some(existing)) => {
            if let Some(stored) = record_version(&existing) {
                if stored >= version {
                    tracing::debug!(
                        key = %String::from_utf8_lossy(key),
                        stored,
                        version,
                        "dropping learn at or below the stored version"
                    );
                    return;
                }
            }
        }
        Ok(None) => {}
        Err(err) => {
            tracing::error!(error = %err, "could not read learned record");
            return;
        }
    }

    let mut record = Vec::with_capacity(value.len() + 8);
    record.extend_from_slice(value);
    record.extend_from_slice(&version.to_be_bytes());
    if let Err(err) = d.store().put(&slot, &record) {
        tracing::error!(error = %err, "could not persist learned value");
        return;
    }

    tracing::info!(
        key = %String::from_utf8_lossy(key),
        version,
        len = value.len(),
        "learned"
    );
}

/// The get path reads whatever this replica last learned; there is no
/// cross-replica coordination and the answer may lag.
pub fn get(d: &Daemon, c: HostId, key: &[u8]) {
    let (rc, value) = match d.store().get(&slot_key(key, LEARNED_SUFFIX)) {
        Ok(Some(mut record)) => {
            if record.len() >= 8 {
                record.truncate(record.len() - 8);
            }
            (ReturnCode::Success, record)
        }
        Ok(None) => (ReturnCode::NotFound, Vec::new()),
        Err(err) => {
            tracing::error!(error = %err, "could not read learned record");
            (ReturnCode::ServerError, Vec::new())
        }
    };
    d.send_get_reply(c, rc, &value);
}
