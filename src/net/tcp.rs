//! TCP transport: one listener per replica, framed streams, lazy outbound
//! connections to the fixed peer table.
//!
//! Every connection opens with a hello frame carrying the dialer's claimed
//! identity (eight big-endian bytes). Replicas announce their fixed id;
//! clients announce zero and are minted an anonymous id by the listener.
//! Replies to a client ride its own socket, so anonymous peers are routable
//! exactly as long as their connection lives.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::frame::{FrameReader, FrameWriter};
use super::{Envelope, Transport, TransportError};
use crate::core::HostId;

/// Hello payload announcing "no fixed identity, mint me one".
pub const HELLO_ANONYMOUS: u64 = 0;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct TcpTransport {
    inbox_rx: Receiver<Envelope>,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_join: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Shared {
    local: HostId,
    addrs: HashMap<HostId, SocketAddr>,
    inbox_tx: Sender<Envelope>,
    peers: Mutex<HashMap<HostId, Peer>>,
    streams: Mutex<Vec<TcpStream>>,
    next_anon: AtomicU64,
    shutdown: AtomicBool,
}

#[derive(Clone)]
struct Peer {
    writer: Arc<Mutex<FrameWriter<TcpStream>>>,
}

impl TcpTransport {
    /// Bind the listener at `addrs[local]` and start accepting.
    pub fn start(
        local: HostId,
        addrs: HashMap<HostId, SocketAddr>,
    ) -> Result<TcpTransport, TransportError> {
        let bind = *addrs.get(&local).ok_or(TransportError::UnknownPeer(local))?;
        let listener = TcpListener::bind(bind)?;
        Self::with_listener(local, addrs, listener)
    }

    /// Start over a listener the caller already bound (tests bind port 0 and
    /// collect the real addresses before wiring the table).
    pub fn with_listener(
        local: HostId,
        addrs: HashMap<HostId, SocketAddr>,
        listener: TcpListener,
    ) -> Result<TcpTransport, TransportError> {
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let (inbox_tx, inbox_rx) = unbounded();
        let shared = Arc::new(Shared {
            local,
            addrs,
            inbox_tx,
            peers: Mutex::new(HashMap::new()),
            streams: Mutex::new(Vec::new()),
            next_anon: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_join = thread::spawn(move || run_accept_loop(listener, accept_shared));

        Ok(TcpTransport {
            inbox_rx,
            local_addr,
            shared,
            accept_join: Mutex::new(Some(accept_join)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, tear down every connection, and join the listener.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        let streams = {
            let mut streams = self.shared.streams.lock().expect("stream list poisoned");
            std::mem::take(&mut *streams)
        };
        for stream in streams {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.shared.peers.lock().expect("peer table poisoned").clear();
        if let Some(join) = self
            .accept_join
            .lock()
            .expect("accept join poisoned")
            .take()
        {
            let _ = join.join();
        }
    }

    fn dial(&self, dst: HostId) -> Result<Peer, TransportError> {
        let addr = *self
            .shared
            .addrs
            .get(&dst)
            .ok_or(TransportError::UnknownPeer(dst))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        self.shared.track(&stream);

        let mut writer = FrameWriter::new(stream.try_clone()?);
        writer.write_frame(&self.shared.local.get().to_be_bytes())?;
        let peer = Peer {
            writer: Arc::new(Mutex::new(writer)),
        };
        self.shared
            .peers
            .lock()
            .expect("peer table poisoned")
            .insert(dst, peer.clone());

        let shared = Arc::clone(&self.shared);
        let pump_peer = peer.clone();
        thread::spawn(move || pump_frames(FrameReader::new(stream), dst, pump_peer, shared));
        Ok(peer)
    }
}

impl Transport for TcpTransport {
    fn send(&self, dst: HostId, payload: &[u8]) -> Result<(), TransportError> {
        let cached = self
            .shared
            .peers
            .lock()
            .expect("peer table poisoned")
            .get(&dst)
            .cloned();
        let peer = match cached {
            Some(peer) => peer,
            None => self.dial(dst)?,
        };

        let result = peer
            .writer
            .lock()
            .expect("peer writer poisoned")
            .write_frame(payload);
        if let Err(err) = result {
            self.shared.forget(dst, &peer);
            return Err(err.into());
        }
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, TransportError> {
        match self.inbox_rx.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            // All senders live inside this transport, so this only happens
            // after stop(); report it as "nothing arrived".
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

impl Shared {
    fn track(&self, stream: &TcpStream) {
        if let Ok(clone) = stream.try_clone() {
            self.streams.lock().expect("stream list poisoned").push(clone);
        }
    }

    /// Drop a cached peer, but only if the cache still points at the same
    /// connection; a reconnect may already have replaced it.
    fn forget(&self, id: HostId, peer: &Peer) {
        let mut peers = self.peers.lock().expect("peer table poisoned");
        if let Some(current) = peers.get(&id) {
            if Arc::ptr_eq(&current.writer, &peer.writer) {
                peers.remove(&id);
            }
        }
    }
}

fn run_accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept() {
            Ok((stream, remote)) => {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    if let Err(err) = run_inbound(stream, &shared) {
                        tracing::debug!(%remote, error = %err, "inbound connection closed");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn run_inbound(stream: TcpStream, shared: &Arc<Shared>) -> Result<(), TransportError> {
    // Some platforms hand accepted sockets the listener's nonblocking flag.
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    shared.track(&stream);

    let mut reader = FrameReader::new(stream.try_clone()?);
    let hello = match reader.read_frame()? {
        Some(hello) if hello.len() == 8 => {
            let mut word = [0u8; 8];
            word.copy_from_slice(&hello);
            u64::from_be_bytes(word)
        }
        _ => {
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(());
        }
    };

    let id = if hello == HELLO_ANONYMOUS {
        HostId::anonymous(shared.next_anon.fetch_add(1, Ordering::Relaxed))
    } else {
        let claimed = HostId::new(hello);
        if !HostId::CLUSTER.contains(&claimed) {
            tracing::warn!(claimed = %claimed, "rejecting hello with unknown identity");
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(());
        }
        claimed
    };

    let peer = Peer {
        writer: Arc::new(Mutex::new(FrameWriter::new(stream))),
    };
    shared
        .peers
        .lock()
        .expect("peer table poisoned")
        .insert(id, peer.clone());

    pump_frames(reader, id, peer, Arc::clone(shared));
    Ok(())
}

/// Forward frames from one connection into the shared inbox until the
/// stream closes, then unregister the peer.
fn pump_frames(
    mut reader: FrameReader<TcpStream>,
    from: HostId,
    peer: Peer,
    shared: Arc<Shared>,
) {
    loop {
        match reader.read_frame() {
            Ok(Some(payload)) => {
                if shared.inbox_tx.send(Envelope { from, payload }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                if !shared.shutdown.load(Ordering::Relaxed) {
                    tracing::debug!(from = %from, error = %err, "connection lost");
                }
                break;
            }
        }
    }
    shared.forget(from, &peer);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_table(n: usize) -> (HashMap<HostId, SocketAddr>, Vec<TcpListener>) {
        let mut addrs = HashMap::new();
        let mut listeners = Vec::new();
        for host in HostId::CLUSTER.iter().take(n) {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            addrs.insert(*host, listener.local_addr().unwrap());
            listeners.push(listener);
        }
        (addrs, listeners)
    }

    fn recv_from(transport: &TcpTransport) -> Envelope {
        transport
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("expected a message")
    }

    #[test]
    fn replicas_exchange_messages_both_ways() {
        let (addrs, listeners) = loopback_table(2);
        let mut listeners = listeners.into_iter();
        let a = TcpTransport::with_listener(HostId::A, addrs.clone(), listeners.next().unwrap())
            .unwrap();
        let b =
            TcpTransport::with_listener(HostId::B, addrs, listeners.next().unwrap()).unwrap();

        a.send(HostId::B, b"ping").unwrap();
        let envelope = recv_from(&b);
        assert_eq!(envelope.from, HostId::A);
        assert_eq!(envelope.payload, b"ping");

        // B replies over the connection A dialed.
        b.send(HostId::A, b"pong").unwrap();
        let envelope = recv_from(&a);
        assert_eq!(envelope.from, HostId::B);
        assert_eq!(envelope.payload, b"pong");

        a.stop();
        b.stop();
    }

    #[test]
    fn anonymous_clients_are_minted_distinct_ids() {
        let (addrs, listeners) = loopback_table(1);
        let a = TcpTransport::with_listener(
            HostId::A,
            addrs.clone(),
            listeners.into_iter().next().unwrap(),
        )
        .unwrap();

        let make_client = || {
            let stream = TcpStream::connect(addrs[&HostId::A]).unwrap();
            let mut writer = FrameWriter::new(stream.try_clone().unwrap());
            writer
                .write_frame(&HELLO_ANONYMOUS.to_be_bytes())
                .unwrap();
            (stream, writer)
        };

        let (stream1, mut writer1) = make_client();
        let (_stream2, mut writer2) = make_client();
        writer1.write_frame(b"from one").unwrap();
        writer2.write_frame(b"from two").unwrap();

        let first = recv_from(&a);
        let second = recv_from(&a);
        assert!(first.from.is_anonymous());
        assert!(second.from.is_anonymous());
        assert_ne!(first.from, second.from);

        // The reply to an anonymous peer rides its own socket.
        let one = if first.payload == b"from one" {
            first.from
        } else {
            second.from
        };
        a.send(one, b"reply").unwrap();
        let mut reader = FrameReader::new(stream1);
        assert_eq!(reader.read_frame().unwrap().unwrap(), b"reply");

        a.stop();
    }

    #[test]
    fn send_to_a_vanished_anonymous_peer_fails() {
        let (addrs, listeners) = loopback_table(1);
        let a = TcpTransport::with_listener(
            HostId::A,
            addrs,
            listeners.into_iter().next().unwrap(),
        )
        .unwrap();
        let gone = HostId::anonymous(12345);
        assert!(matches!(
            a.send(gone, b"hello?"),
            Err(TransportError::UnknownPeer(_))
        ));
        a.stop();
    }
}
