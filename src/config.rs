//! Config loading.
//!
//! One optional TOML file; every field has a default, and the defaults
//! describe the canonical local five-replica cluster so a bare checkout
//! runs with no file at all.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{HostId, NUM_HOSTS};

/// Base port of the default local cluster; replica `A` listens here and
/// each following letter takes the next port.
pub const DEFAULT_BASE_PORT: u16 = 4680;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub storage: StorageConfig,
    pub daemon: DaemonConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Cluster letter, `A`..`E`.
    pub host: char,
    pub addr: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let peers = (0..NUM_HOSTS)
            .map(|i| PeerConfig {
                host: (b'A' + i as u8) as char,
                addr: format!("127.0.0.1:{}", DEFAULT_BASE_PORT + i as u16),
            })
            .collect();
        ClusterConfig { peers }
    }
}

impl ClusterConfig {
    /// Resolve the peer table into transport addresses. Rejects unknown
    /// letters, duplicates, unparsable addresses, and any table that does
    /// not cover the whole cluster.
    pub fn address_table(&self) -> Result<HashMap<HostId, SocketAddr>, ConfigError> {
        let mut table = HashMap::new();
        for peer in &self.peers {
            let host = HostId::from_letter(peer.host).ok_or(ConfigError::UnknownHost {
                letter: peer.host,
            })?;
            let addr: SocketAddr =
                peer.addr
                    .parse()
                    .map_err(|_| ConfigError::BadAddress {
                        letter: peer.host,
                        addr: peer.addr.clone(),
                    })?;
            if table.insert(host, addr).is_some() {
                return Err(ConfigError::DuplicateHost { letter: peer.host });
            }
        }
        if table.len() != NUM_HOSTS {
            return Err(ConfigError::IncompleteCluster { got: table.len() });
        }
        Ok(table)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one slot database per replica identity.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("."),
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self, host: HostId) -> PathBuf {
        let letter = host.letter().unwrap_or('X');
        self.data_dir.join(format!("decree-{letter}.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Dispatcher threads pulling from the transport.
    pub workers: usize,
    /// Cadence of the per-key re-drive sweep.
    pub redrive_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            workers: 4,
            redrive_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Extra `tracing` filter directives, applied on top of the verbosity
    /// flag (same syntax as `RUST_LOG`).
    pub filter: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unknown cluster letter {letter:?} (expected A..E)")]
    UnknownHost { letter: char },
    #[error("replica {letter} appears twice in the peer table")]
    DuplicateHost { letter: char },
    #[error("unparsable address {addr:?} for replica {letter}")]
    BadAddress { letter: char, addr: String },
    #[error("peer table names {got} replicas, expected {NUM_HOSTS}")]
    IncompleteCluster { got: usize },
}

/// Load the config at `path`, or the defaults when no path is given.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_the_local_cluster() {
        let table = Config::default().cluster.address_table().unwrap();
        assert_eq!(table.len(), NUM_HOSTS);
        assert_eq!(
            table[&HostId::A],
            format!("127.0.0.1:{DEFAULT_BASE_PORT}").parse().unwrap()
        );
        assert_eq!(
            table[&HostId::E],
            format!("127.0.0.1:{}", DEFAULT_BASE_PORT + 4).parse().unwrap()
        );
    }

    #[test]
    fn partial_files_fall_back_to_defaults_per_section() {
        let config: Config = toml::from_str(
            "[daemon]\n\
             workers = 2\n",
        )
        .unwrap();
        assert_eq!(config.daemon.workers, 2);
        assert_eq!(config.daemon.redrive_interval_ms, 1_000);
        assert_eq!(config.cluster.peers.len(), NUM_HOSTS);
    }

    #[test]
    fn peer_tables_are_validated() {
        let mut config = Config::default();
        config.cluster.peers[1].host = 'A';
        assert!(matches!(
            config.cluster.address_table().unwrap_err(),
            ConfigError::DuplicateHost { letter: 'A' }
        ));

        let mut config = Config::default();
        config.cluster.peers.pop();
        assert!(matches!(
            config.cluster.address_table().unwrap_err(),
            ConfigError::IncompleteCluster { got: 4 }
        ));

        let mut config = Config::default();
        config.cluster.peers[0].addr = "nonsense".into();
        assert!(matches!(
            config.cluster.address_table().unwrap_err(),
            ConfigError::BadAddress { letter: 'A', .. }
        ));
    }

    #[test]
    fn db_paths_are_per_identity() {
        let storage = StorageConfig {
            data_dir: PathBuf::from("/var/lib/decree"),
        };
        assert_eq!(
            storage.db_path(HostId::C),
            PathBuf::from("/var/lib/decree/decree-C.db")
        );
    }
}
