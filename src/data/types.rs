use serde::{Deserialize, Serialize};

use crate::data::crdt::CrdtValue;
use crate::membership::types::NodeId;

/// Opaque gossip payload. CRDT payloads get merge semantics in the store;
/// everything else resolves by timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Crdt(CrdtValue),
}

impl Payload {
    pub fn as_crdt(&self) -> Option<&CrdtValue> {
        match self {
            Payload::Crdt(value) => Some(value),
            _ => None,
        }
    }

    /// Stable byte fingerprint used to break timestamp ties
    /// deterministically across nodes.
    pub fn fingerprint(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }
}

/// A key-value payload scoped to its originating node.
/// Uniquely identified by (node id, key).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerNodeDatum {
    pub node_id: NodeId,
    pub key: String,
    /// Producer wall-clock milliseconds.
    pub timestamp: i64,
    /// Wall-clock expiry; `None` never expires.
    pub expire_at: Option<i64>,
    pub payload: Payload,
}

impl PerNodeDatum {
    pub fn expired(&self, now_ms: i64) -> bool {
        matches!(self.expire_at, Some(at) if at <= now_ms)
    }
}

/// A key-value payload whose key space is shared across the cluster.
/// Uniquely identified by key alone; `node_id` records the last writer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedDatum {
    pub key: String,
    pub node_id: NodeId,
    pub timestamp: i64,
    pub expire_at: Option<i64>,
    pub payload: Payload,
}

impl SharedDatum {
    pub fn expired(&self, now_ms: i64) -> bool {
        matches!(self.expire_at, Some(at) if at <= now_ms)
    }
}

/// Expiry join used by CRDT merges: `None` (never expires) is the top.
pub fn max_expiry(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        _ => None,
    }
}
