//! Engine configuration.
//!
//! `GossipSettings` is plain data handed to the engine constructor; nothing
//! here reads files or the environment. The free-form
//! `active_gossip_properties` map mirrors the operator-facing knobs of the
//! topology-aware gossiper; malformed values are logged and replaced with
//! defaults rather than rejected.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Assumed inter-arrival distribution for the phi accrual failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    Normal,
    Exponential,
}

/// Core protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipSettings {
    /// Base gossip period. Also the cadence of the member state refresher.
    pub gossip_interval_ms: u64,
    /// Failure-detector window size (inter-arrival samples kept per peer).
    pub window_size: usize,
    /// Samples required before phi can convict a peer.
    pub minimum_samples: usize,
    /// A peer is UP iff phi < this threshold.
    pub conviction_threshold: f64,
    /// Distribution assumed by the failure detector.
    pub distribution: Distribution,
    /// Period of the expired-data reaper.
    pub reaper_interval_ms: u64,
    /// Codec name resolved through the protocol registry.
    pub protocol: String,
    /// Transport name resolved through the transport registry.
    pub transport: String,
    /// Active-gossiper name resolved through the gossiper registry.
    pub active_gossiper: String,
    /// Free-form gossiper knobs (interval overrides etc.), string-typed the
    /// way operators supply them.
    pub active_gossip_properties: BTreeMap<String, String>,
    /// Persist the member ring to disk every 60 s and reload it at startup.
    pub persist_ring_state: bool,
    /// Persist per-node/shared data to disk every 60 s and reload at startup.
    pub persist_data_state: bool,
    /// Directory for persisted state files.
    pub path_to_state: PathBuf,
    /// Shared-data lock settings.
    pub lock: LockSettings,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 100,
            window_size: 5000,
            minimum_samples: 5,
            conviction_threshold: 10.0,
            distribution: Distribution::Exponential,
            reaper_interval_ms: 1000,
            protocol: "bincode".to_string(),
            transport: "udp".to_string(),
            active_gossiper: "datacenter-rack-aware".to_string(),
            active_gossip_properties: BTreeMap::new(),
            persist_ring_state: false,
            persist_data_state: false,
            path_to_state: PathBuf::from("."),
            lock: LockSettings::default(),
        }
    }
}

/// Settings for the majority-vote lock manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// How long to wait for votes to arrive before counting.
    pub vote_wait_ms: u64,
    /// How often the vote datum is re-gossiped while waiting.
    pub vote_update_ms: u64,
    /// Lifetime of the vote datum.
    pub vote_ttl_ms: i64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            vote_wait_ms: 3000,
            vote_update_ms: 300,
            vote_ttl_ms: 60_000,
        }
    }
}

/// Tier periods for the datacenter/rack-aware gossiper, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyIntervals {
    pub same_rack_ms: u64,
    pub same_dc_ms: u64,
    pub different_dc_ms: u64,
    pub dead_member_ms: u64,
}

impl Default for TopologyIntervals {
    fn default() -> Self {
        Self {
            same_rack_ms: 100,
            same_dc_ms: 500,
            different_dc_ms: 1000,
            dead_member_ms: 250,
        }
    }
}

impl TopologyIntervals {
    /// Reads interval overrides from the free-form gossiper properties.
    /// Unparseable values are logged and left at their defaults.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Self {
        let mut intervals = Self::default();
        read_interval(properties, "sameRackGossipIntervalMs", &mut intervals.same_rack_ms);
        read_interval(properties, "sameDcGossipIntervalMs", &mut intervals.same_dc_ms);
        read_interval(
            properties,
            "differentDatacenterGossipIntervalMs",
            &mut intervals.different_dc_ms,
        );
        read_interval(
            properties,
            "randomDeadMemberSendIntervalMs",
            &mut intervals.dead_member_ms,
        );
        intervals
    }
}

fn read_interval(properties: &BTreeMap<String, String>, key: &str, slot: &mut u64) {
    if let Some(raw) = properties.get(key) {
        match raw.parse::<u64>() {
            Ok(value) if value > 0 => *slot = value,
            Ok(_) => {
                tracing::warn!("Ignoring zero {} (keeping default {} ms)", key, slot);
            }
            Err(e) => {
                tracing::warn!(
                    "Unparseable {} = {:?} ({}), keeping default {} ms",
                    key,
                    raw,
                    e,
                    slot
                );
            }
        }
    }
}
