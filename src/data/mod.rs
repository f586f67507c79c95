//! Replicated per-node and shared data.
//!
//! Producers write locally, the active gossiper spreads entries to peers,
//! and inbound copies land through the dispatcher. Conflicts resolve by
//! timestamp (with a deterministic tie-break) or, for CRDT payloads, by
//! lattice merge. The reaper deletes entries once their TTL passes.

pub mod crdt;
pub mod reaper;
pub mod store;
pub mod types;
