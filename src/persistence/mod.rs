//! Ring and user-data persistence.
//!
//! Snapshots the member ring and the data store to JSON files so a
//! restarted node rejoins with its last known peers and data instead of a
//! cold bootstrap. The engine schedules writes at a fixed 60-second cadence
//! and loads whatever exists at construction. Load failures are logged and
//! treated as an empty state; persistence is an optimization, never a
//! correctness requirement.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::data::store::DataStore;
use crate::data::types::{PerNodeDatum, SharedDatum};
use crate::membership::table::MembershipTable;
use crate::membership::types::Member;

/// Cadence of the persistence tasks while the engine runs.
pub const PERSIST_INTERVAL_SECS: u64 = 60;

pub fn ring_state_path(dir: &Path, cluster: &str, id: &str) -> PathBuf {
    dir.join(format!("ringstate.{}.{}.json", cluster, id))
}

pub fn per_node_data_path(dir: &Path, cluster: &str, id: &str) -> PathBuf {
    dir.join(format!("pernodedata.{}.{}.json", cluster, id))
}

pub fn shared_data_path(dir: &Path, cluster: &str, id: &str) -> PathBuf {
    dir.join(format!("shareddata.{}.{}.json", cluster, id))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec(value)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return None,
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring unreadable state file {:?}: {}", path, e);
            None
        }
    }
}

/// Persists the known member ring.
pub struct RingStatePersister {
    path: PathBuf,
    table: Arc<MembershipTable>,
}

impl RingStatePersister {
    pub fn new(path: PathBuf, table: Arc<MembershipTable>) -> Arc<Self> {
        Arc::new(Self { path, table })
    }

    /// One snapshot write. Errors are logged; the next tick retries.
    pub fn write(&self) {
        let members: Vec<Member> = self
            .table
            .snapshot_all()
            .into_iter()
            .map(|(member, _)| member)
            .collect();
        if let Err(e) = write_json(&self.path, &members) {
            tracing::error!("Failed to persist ring state to {:?}: {}", self.path, e);
        }
    }

    /// Members recorded by a previous run; empty when nothing usable exists.
    pub fn read_from_disk(path: &Path) -> Vec<Member> {
        read_json(path).unwrap_or_default()
    }
}

/// Persists per-node and shared data maps.
pub struct UserDataPersister {
    per_node_path: PathBuf,
    shared_path: PathBuf,
    store: Arc<DataStore>,
}

impl UserDataPersister {
    pub fn new(per_node_path: PathBuf, shared_path: PathBuf, store: Arc<DataStore>) -> Arc<Self> {
        Arc::new(Self {
            per_node_path,
            shared_path,
            store,
        })
    }

    pub fn write(&self) {
        if let Err(e) = write_json(&self.per_node_path, &self.store.per_node_snapshot()) {
            tracing::error!(
                "Failed to persist per-node data to {:?}: {}",
                self.per_node_path,
                e
            );
        }
        if let Err(e) = write_json(&self.shared_path, &self.store.shared_snapshot()) {
            tracing::error!(
                "Failed to persist shared data to {:?}: {}",
                self.shared_path,
                e
            );
        }
    }

    pub fn read_per_node_from_disk(path: &Path) -> Vec<PerNodeDatum> {
        read_json(path).unwrap_or_default()
    }

    pub fn read_shared_from_disk(path: &Path) -> Vec<SharedDatum> {
        read_json(path).unwrap_or_default()
    }
}
