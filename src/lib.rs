#![forbid(unsafe_code)]

//! decree: a five-replica key-value store whose writes are serialized by a
//! per-key single-decree Paxos round.
//!
//! Every replica plays proposer, acceptor, and learner for every key. A
//! client write queues on the key's write state machine, which drives
//! phase-1/phase-2 rounds against the fixed cluster and replies once its
//! value is the one decided. Reads go to a single replica and may lag.

pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
pub mod net;
pub mod storage;
pub mod telemetry;
pub mod test_harness;

pub use client::Client;
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::core::{Ballot, HostId, Message, PValue, ReturnCode, NUM_HOSTS, QUORUM};
