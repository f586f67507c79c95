use serde::{Deserialize, Serialize};

use crate::data::types::{PerNodeDatum, SharedDatum};
use crate::membership::types::{Member, NodeId};

/// The four message kinds exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    /// The sender's view of itself plus the members it has learned of.
    MembershipList {
        from: Member,
        members: Vec<Member>,
    },

    /// One per-node datum owned by some origin node.
    PerNodeData(PerNodeDatum),

    /// One shared datum; CRDT payloads merge on arrival.
    SharedData(SharedDatum),

    /// Optimistic notice that a node is leaving. Receivers mark it DOWN
    /// immediately instead of waiting for phi to accrue.
    Shutdown { node_id: NodeId },
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::MembershipList { .. } => "membership-list",
            GossipMessage::PerNodeData(_) => "per-node-data",
            GossipMessage::SharedData(_) => "shared-data",
            GossipMessage::Shutdown { .. } => "shutdown",
        }
    }
}
