//! Peer-to-peer cluster membership and data dissemination.
//!
//! Nodes exchange periodic gossip over UDP to maintain a live view of the
//! cluster and a replicated map of application payloads. The crate is built
//! from loosely coupled subsystems composed by the [`gossip::engine::GossipEngine`]:
//!
//! - **`membership`**: the ordered member table, phi accrual failure
//!   detection and the periodic UP/DOWN refresher.
//! - **`data`**: per-node and cluster-shared payloads with last-writer-wins
//!   resolution, CRDT merge, TTL expiry and subscriber callbacks.
//! - **`gossip`**: partner selection with datacenter/rack-aware send rates,
//!   the drop-oldest worker pool, inbound dispatch and the engine itself.
//! - **`protocol`** / **`transport`**: pluggable wire codec and datagram
//!   transport, both picked by name from small registries.
//! - **`persistence`**: optional ring and user-data snapshots so restarts
//!   rejoin warm.
//! - **`lock`**: best-effort distributed locks built on majority-vote CRDTs
//!   gossiped through the shared map.

pub mod config;
pub mod data;
pub mod error;
pub mod gossip;
pub mod lock;
pub mod membership;
pub mod persistence;
pub mod protocol;
pub mod time;
pub mod transport;
