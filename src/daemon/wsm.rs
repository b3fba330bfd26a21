//! The per-key write state machine: the proposer.
//!
//! One machine serializes every write to its key. It is not a coroutine:
//! each inbound event locks the state, applies it, and re-runs `advance`,
//! which looks at the whole state and performs whichever broadcast the
//! round is missing. Waiting for a quorum is just "advance sent phase-1a
//! and returned"; the next phase-1b re-enters it.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use super::Daemon;
use crate::core::types::{Ballot, HostId, PValue, ReturnCode, QUORUM};
use crate::core::wire::Message;

pub struct WriteStateMachine {
    key: Bytes,
    state: Mutex<WsmState>,
}

#[derive(Default)]
struct WsmState {
    /// Pending writes in arrival order; the head is the value this replica
    /// is currently trying to get decided.
    queue: VecDeque<PendingWrite>,
    executing_paxos: bool,
    /// Ballot of the round in flight.
    leading: Ballot,
    /// Hosts that promised `leading`.
    promises: BTreeSet<HostId>,
    /// Hosts that accepted at `leading`.
    accepted: BTreeSet<HostId>,
    /// Highest previously-accepted pvalue any promise reported, seeded with
    /// the head-of-queue value so an unconstrained round proposes it.
    max_accepted: PValue,
    /// The decree this proposer believes it is deciding.
    version: u64,
}

struct PendingWrite {
    client: HostId,
    value: Bytes,
}

fn wallclock_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

impl WriteStateMachine {
    pub fn new(key: Bytes) -> WriteStateMachine {
        WriteStateMachine {
            key,
            state: Mutex::new(WsmState::default()),
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Idle: nothing queued and no round in flight. Idle machines are
    /// eligible for reclamation.
    pub fn finished(&self) -> bool {
        let state = self.lock();
        state.queue.is_empty() && !state.executing_paxos
    }

    /// A client write arrived.
    pub fn write(&self, client: HostId, value: Bytes, d: &Daemon) {
        let mut state = self.lock();
        state.queue.push_back(PendingWrite { client, value });
        self.advance(&mut state, d);
    }

    /// A phase-1b reply arrived. A reply for a newer version or a higher
    /// ballot means this round is dead: abandon it, adopt the version, and
    /// let `advance` start over. Otherwise fold in the promise, keeping the
    /// highest previously-accepted pvalue the quorum has reported.
    pub fn phase1b(&self, c: HostId, version: u64, ballot: Ballot, accepted: PValue, d: &Daemon) {
        let mut state = self.lock();

        if (state.version != 0 && version > state.version) || ballot > state.leading {
            state.executing_paxos = false;
            state.version = version;
            return self.advance(&mut state, d);
        }

        state.version = version;
        if !accepted.ballot.is_zero() && accepted.ballot > state.max_accepted.ballot {
            state.max_accepted = accepted;
        }
        state.promises.insert(c);
        self.advance(&mut state, d);
    }

    /// A phase-2b reply arrived. Replies for any other round are stale and
    /// dropped.
    pub fn phase2b(&self, c: HostId, version: u64, ballot: Ballot, d: &Daemon) {
        let mut state = self.lock();
        if version != state.version || ballot != state.leading {
            return;
        }
        state.accepted.insert(c);
        self.advance(&mut state, d);
    }

    /// An acceptor told us the round we proposed is gone; move to the next
    /// version and start over.
    pub fn retry(&self, d: &Daemon) {
        let mut state = self.lock();
        state.executing_paxos = false;
        state.version += 1;
        self.advance(&mut state, d);
    }

    /// Periodic re-drive: rebroadcasts whatever the in-flight round is
    /// still missing, or starts a round if writes queued while none ran.
    pub fn poke(&self, d: &Daemon) {
        let mut state = self.lock();
        self.advance(&mut state, d);
    }

    fn lock(&self) -> MutexGuard<'_, WsmState> {
        self.state.lock().expect("write state machine poisoned")
    }

    fn advance(&self, state: &mut WsmState, d: &Daemon) {
        loop {
            if !state.executing_paxos {
                let Some(front) = state.queue.front() else {
                    return;
                };
                state.executing_paxos = true;
                state.leading = Ballot {
                    number: wallclock_now(),
                    leader: d.host(),
                };
                state.promises.clear();
                state.accepted.clear();
                state.max_accepted = PValue {
                    ballot: Ballot::ZERO,
                    value: front.value.clone(),
                };
            }

            // A promise reported an acceptance above our own ballot; this
            // round can never win. Start over with a fresh ballot.
            if state.max_accepted.ballot > state.leading {
                state.executing_paxos = false;
                continue;
            }

            if state.promises.len() < QUORUM {
                for host in HostId::CLUSTER {
                    if state.promises.contains(&host) {
                        continue;
                    }
                    d.send_message(
                        host,
                        &Message::Phase1a {
                            key: self.key.clone(),
                            version: state.version,
                            ballot: state.leading,
                        },
                    );
                }
                return;
            }

            if state.accepted.len() < QUORUM {
                // From here on the pvalue is ours: propose it at our ballot.
                state.max_accepted.ballot = state.leading;
                for host in HostId::CLUSTER {
                    if state.accepted.contains(&host) {
                        continue;
                    }
                    d.send_message(
                        host,
                        &Message::Phase2a {
                            key: self.key.clone(),
                            version: state.version,
                            ballot: state.leading,
                            pvalue: state.max_accepted.clone(),
                        },
                    );
                }
                return;
            }

            // Decided: tell everyone, close the round, move to the next
            // version.
            for host in HostId::CLUSTER {
                d.send_message(
                    host,
                    &Message::Learn {
                        key: self.key.clone(),
                        version: state.version,
                        value: state.max_accepted.value.clone(),
                    },
                );
            }
            state.executing_paxos = false;
            state.version += 1;

            // Only pop the queue if the decided value is the head's value;
            // when a prior acceptance won instead, the head stays put and
            // the next round (next version) will carry it again.
            if let Some(front) = state.queue.front() {
                if front.value == state.max_accepted.value {
                    d.send_put_reply(front.client, ReturnCode::Success);
                    state.queue.pop_front();
                }
            }
        }
    }
}
