//! In-process cluster support for tests.
//!
//! Five daemons over an in-memory transport hub, driven by the same
//! dispatch loop the binary runs. Not a stable API; panics instead of
//! propagating errors because its only callers are tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::core::types::{HostId, ReturnCode};
use crate::core::wire::{self, Message};
use crate::daemon::Daemon;
use crate::net::{Envelope, Transport, TransportError};
use crate::storage::MemoryMap;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Routes payloads between attached transports by identity. Deliveries to
/// a blackholed identity vanish silently, which is exactly the best-effort
/// contract the real transport has.
#[derive(Default)]
pub struct MemHub {
    inboxes: Mutex<HashMap<HostId, Sender<Envelope>>>,
    blackholed: Mutex<HashSet<HostId>>,
    next_anon: AtomicU64,
}

impl MemHub {
    pub fn new() -> Arc<MemHub> {
        Arc::new(MemHub::default())
    }

    pub fn attach(self: &Arc<MemHub>, host: HostId) -> MemTransport {
        let (tx, rx) = unbounded();
        self.inboxes
            .lock()
            .expect("inbox table poisoned")
            .insert(host, tx);
        MemTransport {
            local: host,
            hub: Arc::clone(self),
            rx,
        }
    }

    pub fn attach_anonymous(self: &Arc<MemHub>) -> MemTransport {
        let id = HostId::anonymous(self.next_anon.fetch_add(1, Ordering::Relaxed) + 1);
        self.attach(id)
    }

    /// Silently drop every delivery to `host` until cleared.
    pub fn blackhole(&self, host: HostId, dropped: bool) {
        let mut blackholed = self.blackholed.lock().expect("blackhole set poisoned");
        if dropped {
            blackholed.insert(host);
        } else {
            blackholed.remove(&host);
        }
    }

    fn route(&self, from: HostId, dst: HostId, payload: Vec<u8>) -> Result<(), TransportError> {
        if self
            .blackholed
            .lock()
            .expect("blackhole set poisoned")
            .contains(&dst)
        {
            return Ok(());
        }
        let tx = self
            .inboxes
            .lock()
            .expect("inbox table poisoned")
            .get(&dst)
            .cloned();
        match tx {
            Some(tx) => tx
                .send(Envelope { from, payload })
                .map_err(|_| TransportError::UnknownPeer(dst)),
            None => Err(TransportError::UnknownPeer(dst)),
        }
    }
}

pub struct MemTransport {
    local: HostId,
    hub: Arc<MemHub>,
    rx: Receiver<Envelope>,
}

impl Transport for MemTransport {
    fn send(&self, dst: HostId, payload: &[u8]) -> Result<(), TransportError> {
        self.hub.route(self.local, dst, payload.to_vec())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

/// Five live daemons plus the hub that connects them.
pub struct TestCluster {
    hub: Arc<MemHub>,
    daemons: HashMap<HostId, Arc<Daemon>>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl TestCluster {
    pub fn start() -> TestCluster {
        let hub = MemHub::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut daemons = HashMap::new();
        let mut workers = Vec::new();

        for host in HostId::CLUSTER {
            let transport = Arc::new(hub.attach(host));
            let daemon = Arc::new(Daemon::new(
                host,
                transport.clone(),
                Arc::new(MemoryMap::new()),
            ));
            for _ in 0..2 {
                let daemon = Arc::clone(&daemon);
                let transport = Arc::clone(&transport);
                let shutdown = Arc::clone(&shutdown);
                workers.push(thread::spawn(move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        match transport.recv_timeout(Duration::from_millis(20)) {
                            Ok(Some(envelope)) => {
                                daemon.dispatch(envelope.from, &envelope.payload)
                            }
                            Ok(None) => {}
                            Err(_) => break,
                        }
                    }
                }));
            }
            daemons.insert(host, daemon);
        }

        TestCluster {
            hub,
            daemons,
            shutdown,
            workers,
        }
    }

    pub fn hub(&self) -> &Arc<MemHub> {
        &self.hub
    }

    pub fn daemon(&self, host: HostId) -> &Arc<Daemon> {
        &self.daemons[&host]
    }

    /// Run one re-drive sweep on every replica.
    pub fn sweep_all(&self) {
        for daemon in self.daemons.values() {
            daemon.sweep();
        }
    }

    pub fn client(&self) -> TestClient {
        TestClient {
            transport: self.hub.attach_anonymous(),
            reqno: 0,
        }
    }

    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

/// Wire-level client for the in-memory cluster.
pub struct TestClient {
    transport: MemTransport,
    reqno: u64,
}

impl TestClient {
    /// Round-robin put, like the production client.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> ReturnCode {
        let host = HostId::CLUSTER[self.reqno as usize % HostId::CLUSTER.len()];
        self.reqno = self.reqno.wrapping_add(1);
        self.put_to(host, key, value)
    }

    pub fn put_to(&mut self, host: HostId, key: &[u8], value: &[u8]) -> ReturnCode {
        let msg = Message::Put {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        };
        self.transport
            .send(host, &wire::encode_message(&msg))
            .expect("hub delivery failed");
        let reply = self.await_reply();
        wire::decode_put_reply(&reply).expect("bad put reply")
    }

    pub fn get_from(&mut self, host: HostId, key: &[u8]) -> (ReturnCode, Vec<u8>) {
        let msg = Message::Get {
            key: Bytes::copy_from_slice(key),
        };
        self.transport
            .send(host, &wire::encode_message(&msg))
            .expect("hub delivery failed");
        let reply = self.await_reply();
        let (rc, value) = wire::decode_get_reply(&reply).expect("bad get reply");
        (rc, value.to_vec())
    }

    fn await_reply(&self) -> Vec<u8> {
        match self
            .transport
            .recv_timeout(REPLY_TIMEOUT)
            .expect("hub recv failed")
        {
            Some(envelope) => envelope.payload,
            None => panic!("no reply within {REPLY_TIMEOUT:?}"),
        }
    }
}

/// Poll `condition` until it holds or the deadline passes.
pub fn eventually<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}
