//! Message schemas and the byte codec.
//!
//! Every server-bound message is a 1-byte type tag followed by its body.
//! Integers are big-endian u64; byte strings carry a big-endian u32 length
//! prefix. A ballot is number then leader; a pvalue is ballot then value.
//! Replies to clients are untagged: a put reply is a bare return code, a get
//! reply is a return code followed by the value.

use bytes::Bytes;
use thiserror::Error;

use super::types::{Ballot, HostId, PValue, ReturnCode};

pub const TAG_PUT: u8 = b'P';
pub const TAG_GET: u8 = b'G';
pub const TAG_PHASE1A: u8 = b'a';
pub const TAG_PHASE1B: u8 = b'b';
pub const TAG_PHASE2A: u8 = b'A';
pub const TAG_PHASE2B: u8 = b'B';
pub const TAG_LEARN: u8 = b'L';
pub const TAG_RETRY: u8 = b'R';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown message tag {tag:#04x}")]
    UnknownTag { tag: u8 },
    #[error("unknown return code {code}")]
    UnknownReturnCode { code: u8 },
}

/// A decoded server-bound message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Put {
        key: Bytes,
        value: Bytes,
    },
    Get {
        key: Bytes,
    },
    Phase1a {
        key: Bytes,
        version: u64,
        ballot: Ballot,
    },
    Phase1b {
        key: Bytes,
        version: u64,
        ballot: Ballot,
        accepted: PValue,
    },
    Phase2a {
        key: Bytes,
        version: u64,
        ballot: Ballot,
        pvalue: PValue,
    },
    Phase2b {
        key: Bytes,
        version: u64,
        ballot: Ballot,
    },
    Learn {
        key: Bytes,
        version: u64,
        value: Bytes,
    },
    Retry {
        key: Bytes,
    },
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Put { .. } => TAG_PUT,
            Message::Get { .. } => TAG_GET,
            Message::Phase1a { .. } => TAG_PHASE1A,
            Message::Phase1b { .. } => TAG_PHASE1B,
            Message::Phase2a { .. } => TAG_PHASE2A,
            Message::Phase2b { .. } => TAG_PHASE2B,
            Message::Learn { .. } => TAG_LEARN,
            Message::Retry { .. } => TAG_RETRY,
        }
    }

    pub fn key(&self) -> &Bytes {
        match self {
            Message::Put { key, .. }
            | Message::Get { key }
            | Message::Phase1a { key, .. }
            | Message::Phase1b { key, .. }
            | Message::Phase2a { key, .. }
            | Message::Phase2b { key, .. }
            | Message::Learn { key, .. }
            | Message::Retry { key } => key,
        }
    }
}

pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut w = Writer::with_tag(msg.tag());
    match msg {
        Message::Put { key, value } => {
            w.slice(key);
            w.slice(value);
        }
        Message::Get { key } => {
            w.slice(key);
        }
        Message::Phase1a {
            key,
            version,
            ballot,
        } => {
            w.slice(key);
            w.u64(*version);
            w.ballot(*ballot);
        }
        Message::Phase1b {
            key,
            version,
            ballot,
            accepted,
        } => {
            w.slice(key);
            w.u64(*version);
            w.ballot(*ballot);
            w.pvalue(accepted);
        }
        Message::Phase2a {
            key,
            version,
            ballot,
            pvalue,
        } => {
            w.slice(key);
            w.u64(*version);
            w.ballot(*ballot);
            w.pvalue(pvalue);
        }
        Message::Phase2b {
            key,
            version,
            ballot,
        } => {
            w.slice(key);
            w.u64(*version);
            w.ballot(*ballot);
        }
        Message::Learn {
            key,
            version,
            value,
        } => {
            w.slice(key);
            w.u64(*version);
            w.slice(value);
        }
        Message::Retry { key } => {
            w.slice(key);
        }
    }
    w.into_vec()
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, WireError> {
    let mut r = Reader::new(bytes);
    let tag = r.u8()?;
    match tag {
        TAG_PUT => Ok(Message::Put {
            key: r.slice()?,
            value: r.slice()?,
        }),
        TAG_GET => Ok(Message::Get { key: r.slice()? }),
        TAG_PHASE1A => Ok(Message::Phase1a {
            key: r.slice()?,
            version: r.u64()?,
            ballot: r.ballot()?,
        }),
        TAG_PHASE1B => Ok(Message::Phase1b {
            key: r.slice()?,
            version: r.u64()?,
            ballot: r.ballot()?,
            accepted: r.pvalue()?,
        }),
        TAG_PHASE2A => Ok(Message::Phase2a {
            key: r.slice()?,
            version: r.u64()?,
            ballot: r.ballot()?,
            pvalue: r.pvalue()?,
        }),
        TAG_PHASE2B => Ok(Message::Phase2b {
            key: r.slice()?,
            version: r.u64()?,
            ballot: r.ballot()?,
        }),
        TAG_LEARN => Ok(Message::Learn {
            key: r.slice()?,
            version: r.u64()?,
            value: r.slice()?,
        }),
        TAG_RETRY => Ok(Message::Retry { key: r.slice()? }),
        tag => Err(WireError::UnknownTag { tag }),
    }
}

pub fn encode_put_reply(rc: ReturnCode) -> Vec<u8> {
    vec![rc.as_u8()]
}

pub fn decode_put_reply(bytes: &[u8]) -> Result<ReturnCode, WireError> {
    Reader::new(bytes).return_code()
}

pub fn encode_get_reply(rc: ReturnCode, value: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_tag(rc.as_u8());
    w.slice(value);
    w.into_vec()
}

pub fn decode_get_reply(bytes: &[u8]) -> Result<(ReturnCode, Bytes), WireError> {
    let mut r = Reader::new(bytes);
    let rc = r.return_code()?;
    let value = r.slice()?;
    Ok((rc, value))
}

/// Append-only encoder over the wire primitives. Shared with the acceptor's
/// persisted record, which uses the same layout.
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Writer {
        Writer { buf: Vec::new() }
    }

    fn with_tag(tag: u8) -> Writer {
        Writer { buf: vec![tag] }
    }

    pub(crate) fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub(crate) fn slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn ballot(&mut self, ballot: Ballot) {
        self.u64(ballot.number);
        self.u64(ballot.leader.get());
    }

    pub(crate) fn pvalue(&mut self, pvalue: &PValue) {
        self.ballot(pvalue.ballot);
        self.slice(&pvalue.value);
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received body. Trailing bytes after the last field are
/// tolerated, matching the forgiving unpack the protocol has always had.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u64(&mut self) -> Result<u64, WireError> {
        let raw = self.take(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(raw);
        Ok(u64::from_be_bytes(word))
    }

    pub(crate) fn slice(&mut self) -> Result<Bytes, WireError> {
        let raw = self.take(4)?;
        let mut len = [0u8; 4];
        len.copy_from_slice(raw);
        let len = u32::from_be_bytes(len) as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    pub(crate) fn ballot(&mut self) -> Result<Ballot, WireError> {
        let number = self.u64()?;
        let leader = HostId::new(self.u64()?);
        Ok(Ballot { number, leader })
    }

    pub(crate) fn pvalue(&mut self) -> Result<PValue, WireError> {
        let ballot = self.ballot()?;
        let value = self.slice()?;
        Ok(PValue { ballot, value })
    }

    fn return_code(&mut self) -> Result<ReturnCode, WireError> {
        let code = self.u8()?;
        ReturnCode::from_u8(code).ok_or(WireError::UnknownReturnCode { code })
    }
}
