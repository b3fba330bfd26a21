//! Peer messaging transport.
//!
//! The core only assumes best-effort delivery between named peers: `send`
//! may silently lose a message (the Paxos machinery re-drives), and `recv`
//! reports who a message claims to be from without authenticating it.

pub mod frame;
pub mod tcp;

use std::time::Duration;

use thiserror::Error;

use crate::core::HostId;

pub use frame::{FrameError, FrameReader, FrameWriter};
pub use tcp::TcpTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no route to {0}")]
    UnknownPeer(HostId),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// An inbound payload and the transport identity it arrived from.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: HostId,
    pub payload: Vec<u8>,
}

/// Best-effort messaging between the five replicas and their clients.
///
/// Implementations must tolerate concurrent `send` and `recv` calls from
/// multiple threads.
pub trait Transport: Send + Sync {
    /// Deliver `payload` to `dst` if a route exists. Failure is reported but
    /// the message may also be lost without one.
    fn send(&self, dst: HostId, payload: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next inbound message. `Ok(None)` means
    /// nothing arrived; callers poll so they can observe shutdown flags.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, TransportError>;
}
