//! Cluster configuration: node identity and the hosts file.
//!
//! A cluster is a fixed, ordered list of peer addresses. The list comes from
//! a hosts file (one ASCII IP address per line, identical on every node);
//! line `i` defines node `i`, and node 0 is the coordinator. The file path
//! defaults to `/etc/pbsm/hosts.conf` and can be overridden with the
//! `PBSM_HOSTS_FILE` environment variable.
//!
//! Membership is fixed for the life of the cluster; there is no join or
//! leave protocol.

use std::fmt;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

/// Default path of the hosts file.
pub const DEFAULT_HOSTS_PATH: &str = "/etc/pbsm/hosts.conf";

/// Environment variable overriding [`DEFAULT_HOSTS_PATH`].
pub const HOSTS_FILE_ENV: &str = "PBSM_HOSTS_FILE";

/// Hard cap on cluster size; hosts beyond this are ignored.
pub const MAX_NODES: usize = 100;

/// First TCP port of the mesh; node `i` listens on `base_port + i`.
pub const DEFAULT_BASE_PORT: u16 = 2000;

/// Identity of one peer process within the cluster.
///
/// Node 0 is the coordinator: the initial owner of every variable and the
/// serializer of barrier rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The coordinator's id.
    pub const COORDINATOR: NodeId = NodeId(0);

    /// Whether this node is the coordinator.
    pub fn is_coordinator(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while loading or validating cluster configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The hosts file could not be read.
    #[error("hosts file {path:?} unreadable: {source}")]
    HostsFileUnreadable {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// The hosts file held no addresses.
    #[error("hosts file {path:?} lists no hosts")]
    NoHosts {
        /// Path that was read.
        path: PathBuf,
    },

    /// A line of the hosts file did not parse as an IP address.
    #[error("invalid host address {address:?} on line {line}")]
    InvalidHostAddress {
        /// The offending text.
        address: String,
        /// 1-based line number.
        line: usize,
    },

    /// The node index given at startup does not name a host-file entry.
    #[error("node index {index} out of range for a cluster of {cluster_size}")]
    NodeIndexOutOfRange {
        /// The requested index.
        index: u64,
        /// Number of configured hosts.
        cluster_size: usize,
    },
}

/// The fixed peer set and port scheme of one cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    peers: Vec<IpAddr>,
    base_port: u16,
}

impl ClusterConfig {
    /// Build a configuration from an explicit peer list.
    pub fn new(peers: Vec<IpAddr>, base_port: u16) -> Self {
        Self { peers, base_port }
    }

    /// Load the hosts file from `PBSM_HOSTS_FILE` or the default path.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(HOSTS_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOSTS_PATH));
        Self::from_file(&path)
    }

    /// Load a hosts file from an explicit path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| ConfigError::HostsFileUnreadable {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut peers = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if peers.len() == MAX_NODES {
                warn!(
                    max = MAX_NODES,
                    path = %path.display(),
                    "hosts file exceeds the node cap, ignoring the rest"
                );
                break;
            }
            let address: IpAddr = trimmed.parse().map_err(|_| ConfigError::InvalidHostAddress {
                address: trimmed.to_string(),
                line: idx + 1,
            })?;
            peers.push(address);
        }
        if peers.is_empty() {
            return Err(ConfigError::NoHosts {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            peers,
            base_port: DEFAULT_BASE_PORT,
        })
    }

    /// Override the base port (node `i` listens on `base_port + i`).
    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    /// Number of nodes in the cluster.
    pub fn cluster_size(&self) -> usize {
        self.peers.len()
    }

    /// First TCP port of the mesh.
    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Check that `index` names a configured host and wrap it.
    pub fn node_id(&self, index: u64) -> Result<NodeId, ConfigError> {
        if (index as usize) < self.peers.len() {
            Ok(NodeId(index))
        } else {
            Err(ConfigError::NodeIndexOutOfRange {
                index,
                cluster_size: self.peers.len(),
            })
        }
    }

    /// The address on which `node` listens for inbound mesh connections.
    pub fn listen_addr_of(&self, node: NodeId) -> SocketAddr {
        let port = self.base_port + node.0 as u16;
        SocketAddr::new(self.peers[node.index()], port)
    }

    /// Iterate over every node id except `this`.
    pub fn remote_peers(&self, this: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.peers.len() as u64).map(NodeId).filter(move |n| *n != this)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_hosts(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_one_address_per_line() {
        let file = write_hosts("10.0.0.1\n10.0.0.2\n10.0.0.3\n");
        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cluster_size(), 3);
        assert_eq!(
            config.listen_addr_of(NodeId(1)),
            "10.0.0.2:2001".parse().unwrap()
        );
    }

    #[test]
    fn skips_blank_lines() {
        let file = write_hosts("10.0.0.1\n\n10.0.0.2\n");
        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cluster_size(), 2);
    }

    #[test]
    fn rejects_empty_file() {
        let file = write_hosts("");
        assert!(matches!(
            ClusterConfig::from_file(file.path()),
            Err(ConfigError::NoHosts { .. })
        ));
    }

    #[test]
    fn rejects_garbage_address() {
        let file = write_hosts("10.0.0.1\nnot-an-ip\n");
        let err = ClusterConfig::from_file(file.path()).unwrap_err();
        match err {
            ConfigError::InvalidHostAddress { address, line } => {
                assert_eq!(address, "not-an-ip");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn caps_cluster_size() {
        let mut contents = String::new();
        for i in 0..MAX_NODES + 5 {
            contents.push_str(&format!("10.0.{}.{}\n", i / 256, i % 256));
        }
        let file = write_hosts(&contents);
        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cluster_size(), MAX_NODES);
    }

    #[test]
    fn validates_node_index() {
        let file = write_hosts("127.0.0.1\n127.0.0.1\n");
        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node_id(1).unwrap(), NodeId(1));
        assert!(matches!(
            config.node_id(2),
            Err(ConfigError::NodeIndexOutOfRange {
                index: 2,
                cluster_size: 2
            })
        ));
    }

    #[test]
    fn remote_peers_excludes_self() {
        let config = ClusterConfig::new(vec!["127.0.0.1".parse().unwrap(); 3], 2000);
        let peers: Vec<NodeId> = config.remote_peers(NodeId(1)).collect();
        assert_eq!(peers, vec![NodeId(0), NodeId(2)]);
    }
}
