//! Inbound message routing.
//!
//! The transport hands every decoded message here. Dispatch mutates the
//! membership table and data store directly and never performs I/O, so it is
//! safe to call from the receive loop without feeding back into the
//! active gossiper.

use std::sync::Arc;

use crate::data::store::DataStore;
use crate::gossip::messages::GossipMessage;
use crate::membership::table::MembershipTable;
use crate::membership::types::NodeId;
use crate::time::Clock;

pub struct MessageDispatcher {
    table: Arc<MembershipTable>,
    store: Arc<DataStore>,
    clock: Arc<dyn Clock>,
    local_id: NodeId,
}

impl MessageDispatcher {
    pub fn new(
        table: Arc<MembershipTable>,
        store: Arc<DataStore>,
        clock: Arc<dyn Clock>,
        local_id: NodeId,
    ) -> Arc<Self> {
        Arc::new(Self {
            table,
            store,
            clock,
            local_id,
        })
    }

    /// Applies one inbound message.
    pub fn dispatch(&self, message: GossipMessage) {
        tracing::trace!("Dispatching {} message", message.kind());
        match message {
            GossipMessage::MembershipList { from, members } => {
                let now_ns = self.clock.now_ns();
                if from.id != self.local_id {
                    self.table.upsert_from_heartbeat(&from, from.heartbeat, now_ns);
                }
                for member in members {
                    // Echoes of ourselves come back in peer lists; skip them.
                    if member.id == self.local_id {
                        continue;
                    }
                    self.table
                        .upsert_from_heartbeat(&member, member.heartbeat, now_ns);
                }
            }
            GossipMessage::PerNodeData(datum) => {
                self.store.add_per_node(datum);
            }
            GossipMessage::SharedData(datum) => {
                self.store.add_shared(datum);
            }
            GossipMessage::Shutdown { node_id } => {
                tracing::info!("Peer {} announced shutdown", node_id);
                self.table.force_down(&node_id);
            }
        }
    }
}
