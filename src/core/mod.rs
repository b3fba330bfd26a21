//! Protocol core: shared types and the wire codec.

pub mod types;
pub mod wire;

pub use types::{Ballot, HostId, PValue, ReturnCode, NUM_HOSTS, QUORUM};
pub use wire::{Message, WireError};
