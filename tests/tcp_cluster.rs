//! End-to-end over real sockets, the production client, and on-disk
//! storage. The cluster binds ephemeral ports and feeds the resulting
//! addresses into the config the client reads.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use decree::client::Client;
use decree::config::{Config, PeerConfig};
use decree::core::HostId;
use decree::daemon::Daemon;
use decree::net::{TcpTransport, Transport};
use decree::storage::SqliteMap;
use decree::test_harness::eventually;

struct TcpCluster {
    config: Config,
    shutdown: Arc<AtomicBool>,
    transports: Vec<Arc<TcpTransport>>,
    workers: Vec<thread::JoinHandle<()>>,
    _data: TempDir,
}

fn start_cluster() -> TcpCluster {
    let data = TempDir::new().unwrap();

    let mut addrs = HashMap::new();
    let mut listeners = Vec::new();
    for host in HostId::CLUSTER {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        addrs.insert(host, listener.local_addr().unwrap());
        listeners.push((host, listener));
    }

    let mut config = Config::default();
    config.cluster.peers = HostId::CLUSTER
        .iter()
        .map(|host| PeerConfig {
            host: host.letter().unwrap(),
            addr: addrs[host].to_string(),
        })
        .collect();

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut transports = Vec::new();
    let mut workers = Vec::new();
    for (host, listener) in listeners {
        let transport =
            Arc::new(TcpTransport::with_listener(host, addrs.clone(), listener).unwrap());
        let store = Arc::new(
            SqliteMap::open(&data.path().join(format!("decree-{host}.db"))).unwrap(),
        );
        let daemon = Arc::new(Daemon::new(host, transport.clone(), store));
        for _ in 0..2 {
            let daemon = Arc::clone(&daemon);
            let transport = Arc::clone(&transport);
            let shutdown = Arc::clone(&shutdown);
            workers.push(thread::spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    if let Ok(Some(envelope)) =
                        transport.recv_timeout(Duration::from_millis(20))
                    {
                        daemon.dispatch(envelope.from, &envelope.payload);
                    }
                }
            }));
        }
        transports.push(transport);
    }

    TcpCluster {
        config,
        shutdown,
        transports,
        workers,
        _data: data,
    }
}

impl TcpCluster {
    fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for transport in &self.transports {
            transport.stop();
        }
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

#[test]
fn the_production_client_round_trips_against_a_real_cluster() {
    let cluster = start_cluster();
    let mut client = Client::new(&cluster.config)
        .unwrap()
        .with_timeout(Duration::from_secs(10));

    client.put(b"alpha", b"1").unwrap();
    client.put(b"beta", b"2").unwrap();

    // Reads rotate through the replicas; poll until the learns have landed
    // everywhere the rotation can reach.
    eventually("alpha to be readable from every replica", || {
        (0..HostId::CLUSTER.len())
            .all(|_| client.get(b"alpha").unwrap_or(None) == Some(b"1".to_vec()))
    });
    eventually("beta to be readable from every replica", || {
        (0..HostId::CLUSTER.len())
            .all(|_| client.get(b"beta").unwrap_or(None) == Some(b"2".to_vec()))
    });

    assert_eq!(client.get(b"missing").unwrap(), None);
    cluster.stop();
}

#[test]
fn overwrites_supersede_older_values() {
    let cluster = start_cluster();
    let mut client = Client::new(&cluster.config)
        .unwrap()
        .with_timeout(Duration::from_secs(10));

    client.put(b"k", b"old").unwrap();
    client.put(b"k", b"new").unwrap();

    eventually("every replica to serve the overwrite", || {
        (0..HostId::CLUSTER.len())
            .all(|_| client.get(b"k").unwrap_or(None) == Some(b"new".to_vec()))
    });
    cluster.stop();
}
