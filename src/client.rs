//! Blocking client.
//!
//! Each call picks a replica round-robin over the client's own request
//! counter, lazily connects, and blocks for the reply. A client is one
//! logical caller: methods take `&mut self` and connections are never
//! shared, so concurrent users each create their own `Client`.
//!
//! Reads are served by whichever single replica the counter lands on and
//! may lag the latest decree; that is the protocol, not a defect.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::core::types::{HostId, ReturnCode, NUM_HOSTS};
use crate::core::wire::{self, Message, WireError};
use crate::net::frame::{FrameError, FrameReader, FrameWriter};
use crate::net::tcp::HELLO_ANONYMOUS;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed before a reply arrived")]
    Disconnected,
    #[error("server replied {0:?}")]
    Server(ReturnCode),
}

pub struct Client {
    reqno: u64,
    replicas: Vec<(HostId, SocketAddr)>,
    conns: HashMap<HostId, Conn>,
    timeout: Option<Duration>,
}

struct Conn {
    reader: FrameReader<TcpStream>,
    writer: FrameWriter<TcpStream>,
}

impl Client {
    pub fn new(config: &Config) -> Result<Client, ClientError> {
        let table = config.cluster.address_table()?;
        let replicas = HostId::CLUSTER
            .iter()
            .map(|host| (*host, table[host]))
            .collect();
        Ok(Client {
            reqno: 0,
            replicas,
            conns: HashMap::new(),
            timeout: None,
        })
    }

    /// Cap how long a call may block awaiting a reply. Without one, calls
    /// wait forever.
    pub fn with_timeout(mut self, timeout: Duration) -> Client {
        self.timeout = Some(timeout);
        self
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), ClientError> {
        let reply = self.call(&Message::Put {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        })?;
        match wire::decode_put_reply(&reply)? {
            ReturnCode::Success => Ok(()),
            rc => Err(ClientError::Server(rc)),
        }
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, ClientError> {
        let reply = self.call(&Message::Get {
            key: Bytes::copy_from_slice(key),
        })?;
        let (rc, value) = wire::decode_get_reply(&reply)?;
        match rc {
            ReturnCode::Success => Ok(Some(value.to_vec())),
            ReturnCode::NotFound => Ok(None),
            rc => Err(ClientError::Server(rc)),
        }
    }

    /// One request/response exchange with the next replica in rotation. Any
    /// failure drops that connection; the next call rotates onward and
    /// redials.
    fn call(&mut self, msg: &Message) -> Result<Vec<u8>, ClientError> {
        let (host, addr) = self.replicas[self.reqno as usize % NUM_HOSTS];
        self.reqno = self.reqno.wrapping_add(1);

        if !self.conns.contains_key(&host) {
            let conn = self.connect(addr)?;
            self.conns.insert(host, conn);
        }
        let conn = self
            .conns
            .get_mut(&host)
            .expect("connection just inserted");

        let result = Self::exchange(conn, &wire::encode_message(msg));
        if result.is_err() {
            self.conns.remove(&host);
        }
        result
    }

    fn exchange(conn: &mut Conn, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        conn.writer.write_frame(payload)?;
        match conn.reader.read_frame()? {
            Some(reply) => Ok(reply),
            None => Err(ClientError::Disconnected),
        }
    }

    fn connect(&self, addr: SocketAddr) -> Result<Conn, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.timeout)?;
        let mut writer = FrameWriter::new(stream.try_clone()?);
        writer.write_frame(&HELLO_ANONYMOUS.to_be_bytes())?;
        Ok(Conn {
            reader: FrameReader::new(stream),
            writer,
        })
    }
}

/// Bulk loader: one `key value` pair per stdin line, stopping at the first
/// malformed line or failed write.
pub fn load_lines<R: std::io::BufRead, W: std::io::Write>(
    client: &mut Client,
    input: R,
    progress: &mut W,
) -> Result<u64, ClientError> {
    let mut loaded = 0u64;
    for line in input.lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(' ') else {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid line {}: expected \"key value\"", loaded + 1),
            )));
        };
        client.put(key.as_bytes(), value.as_bytes())?;
        loaded += 1;
        if loaded % 1_000 == 0 {
            let _ = writeln!(progress, "{loaded} keys loaded");
        }
    }
    Ok(loaded)
}
