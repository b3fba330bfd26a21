//! Identities, ballots, and the wire-level return codes.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Number of replicas in the fixed cluster.
pub const NUM_HOSTS: usize = 5;

/// Majority of the fixed cluster.
pub const QUORUM: usize = NUM_HOSTS / 2 + 1;

/// Transport identity: one of the five fixed replicas, or an anonymous
/// client connection minted by the listener.
///
/// Replica identities put the cluster letter in the high half of the word;
/// anonymous identities have bit 63 set, so the two ranges never collide.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(u64);

impl HostId {
    pub const A: HostId = HostId((b'A' as u64) << 32);
    pub const B: HostId = HostId((b'B' as u64) << 32);
    pub const C: HostId = HostId((b'C' as u64) << 32);
    pub const D: HostId = HostId((b'D' as u64) << 32);
    pub const E: HostId = HostId((b'E' as u64) << 32);

    /// The five replica identities, in letter order.
    pub const CLUSTER: [HostId; NUM_HOSTS] =
        [HostId::A, HostId::B, HostId::C, HostId::D, HostId::E];

    const ANON_BIT: u64 = 1 << 63;

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Replica identity for a cluster letter `A`..`E`.
    pub fn from_letter(letter: char) -> Option<HostId> {
        match letter {
            'A'..='E' => Some(HostId((letter as u64) << 32)),
            _ => None,
        }
    }

    /// Cluster letter, if this is one of the five replica identities.
    pub fn letter(self) -> Option<char> {
        let high = self.0 >> 32;
        if self.0 & 0xffff_ffff == 0 && (b'A' as u64..=b'E' as u64).contains(&high) {
            Some(high as u8 as char)
        } else {
            None
        }
    }

    /// Mint the `n`th anonymous identity.
    pub const fn anonymous(n: u64) -> HostId {
        HostId(Self::ANON_BIT | n)
    }

    pub const fn is_anonymous(self) -> bool {
        self.0 & Self::ANON_BIT != 0
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.letter() {
            Some(letter) => write!(f, "HostId({letter})"),
            None => write!(f, "HostId({:#x})", self.0),
        }
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.letter() {
            Some(letter) => write!(f, "{letter}"),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

/// Proposal ordering token: a wallclock-derived number plus the proposing
/// replica. Field order gives the lexicographic comparison the protocol
/// relies on; `Ballot::ZERO` sorts below every real ballot.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ballot {
    pub number: u64,
    pub leader: HostId,
}

impl Ballot {
    /// The sentinel ballot: never proposed, compares below everything.
    pub const ZERO: Ballot = Ballot {
        number: 0,
        leader: HostId::new(0),
    };

    pub fn is_zero(self) -> bool {
        self == Ballot::ZERO
    }
}

impl fmt::Debug for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ballot({}, {})", self.number, self.leader)
    }
}

/// A value accepted at a ballot. The sentinel pvalue carries the sentinel
/// ballot and an empty value.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PValue {
    pub ballot: Ballot,
    pub value: Bytes,
}

impl PValue {
    pub fn is_zero(&self) -> bool {
        self.ballot.is_zero() && self.value.is_empty()
    }
}

impl fmt::Debug for PValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PValue({:?}, {} bytes)", self.ballot, self.value.len())
    }
}

/// Wire return codes, one byte each. The numbering is part of the client
/// protocol and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Success = 0,
    NotFound = 1,
    SeeErrno = 2,
    ServerError = 3,
    Internal = 4,
    Garbage = 5,
}

impl ReturnCode {
    pub fn from_u8(code: u8) -> Option<ReturnCode> {
        match code {
            0 => Some(ReturnCode::Success),
            1 => Some(ReturnCode::NotFound),
            2 => Some(ReturnCode::SeeErrno),
            3 => Some(ReturnCode::ServerError),
            4 => Some(ReturnCode::Internal),
            5 => Some(ReturnCode::Garbage),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ballot_order_is_lexicographic() {
        let low = Ballot {
            number: 5,
            leader: HostId::E,
        };
        let high = Ballot {
            number: 6,
            leader: HostId::A,
        };
        assert!(low < high, "number dominates leader");

        let left = Ballot {
            number: 6,
            leader: HostId::A,
        };
        let right = Ballot {
            number: 6,
            leader: HostId::B,
        };
        assert!(left < right, "leader breaks number ties");
    }

    #[test]
    fn sentinel_ballot_sorts_below_real_ballots() {
        let real = Ballot {
            number: 1,
            leader: HostId::A,
        };
        assert!(Ballot::ZERO < real);
        assert!(Ballot::ZERO.is_zero());
        assert!(!real.is_zero());
    }

    #[test]
    fn host_letters_round_trip() {
        for (i, host) in HostId::CLUSTER.iter().enumerate() {
            let letter = (b'A' + i as u8) as char;
            assert_eq!(HostId::from_letter(letter), Some(*host));
            assert_eq!(host.letter(), Some(letter));
            assert!(!host.is_anonymous());
        }
        assert_eq!(HostId::from_letter('F'), None);
        assert_eq!(HostId::from_letter('a'), None);
    }

    #[test]
    fn anonymous_ids_never_collide_with_replicas() {
        let anon = HostId::anonymous(0x41_0000_0000);
        assert!(anon.is_anonymous());
        assert_eq!(anon.letter(), None);
        assert!(!HostId::CLUSTER.contains(&anon));
    }
}
