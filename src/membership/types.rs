use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Property key carrying a member's datacenter tag.
pub const DATACENTER: &str = "datacenter";
/// Property key carrying a member's rack tag.
pub const RACK: &str = "rack";

/// Unique identifier for a node in the cluster.
/// Wrapper around an opaque string; the demo binary uses UUID v4.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reachable peer address. Immutable once a peer is known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "udp".to_string(),
            host: host.into(),
            port,
        }
    }

    /// `host:port` form handed to the socket layer.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    /// Parses `scheme://host:port` (e.g. `udp://127.0.0.1:5000`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| anyhow::anyhow!("endpoint missing scheme: {}", s))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("endpoint missing port: {}", s))?;
        if host.is_empty() {
            return Err(anyhow::anyhow!("endpoint missing host: {}", s));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port: port.parse()?,
        })
    }
}

/// Health of a peer as judged by the local failure detector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PeerState {
    Up,
    Down,
}

/// A cluster member as advertised over the wire.
///
/// `heartbeat` is strictly increasing for the local member (advanced to the
/// monotonic clock before every outbound push) and the last observed value
/// for remote members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub cluster: String,
    pub id: NodeId,
    pub endpoint: Endpoint,
    pub properties: BTreeMap<String, String>,
    pub heartbeat: i64,
}

impl Member {
    pub fn new(
        cluster: impl Into<String>,
        id: NodeId,
        endpoint: Endpoint,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            id,
            endpoint,
            properties,
            heartbeat: 0,
        }
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.properties.get(DATACENTER).map(String::as_str)
    }

    pub fn rack(&self) -> Option<&str> {
        self.properties.get(RACK).map(String::as_str)
    }

    pub fn key(&self) -> MemberKey {
        MemberKey {
            cluster: self.cluster.clone(),
            id: self.id.clone(),
        }
    }
}

/// Ordering key for the membership table: lexicographic on
/// (cluster name, node id) so snapshots are reproducible everywhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberKey {
    pub cluster: String,
    pub id: NodeId,
}
