//! Replicated data store.
//!
//! Two maps: per-node data keyed by (origin node, key) and cluster-shared
//! data keyed by key alone. Non-CRDT writes resolve by timestamp with a
//! deterministic fingerprint tie-break; CRDT writes are lattice merges under
//! the per-key map guard. Expired entries are invisible to lookups even
//! before the reaper deletes them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::data::crdt::CrdtValue;
use crate::data::types::{max_expiry, Payload, PerNodeDatum, SharedDatum};
use crate::membership::types::NodeId;
use crate::time::Clock;

/// Subscriber for per-node updates: (node id, key, previous, new).
pub type PerNodeSubscriberFn =
    Arc<dyn Fn(&NodeId, &str, Option<&PerNodeDatum>, Option<&PerNodeDatum>) + Send + Sync>;

/// Subscriber for shared updates: (key, previous, new).
pub type SharedSubscriberFn =
    Arc<dyn Fn(&str, Option<&SharedDatum>, Option<&SharedDatum>) + Send + Sync>;

pub struct DataStore {
    per_node: DashMap<NodeId, DashMap<String, PerNodeDatum>>,
    shared: DashMap<String, SharedDatum>,
    per_node_subscribers: RwLock<Vec<(u64, PerNodeSubscriberFn)>>,
    shared_subscribers: RwLock<Vec<(u64, SharedSubscriberFn)>>,
    next_subscriber_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl DataStore {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            per_node: DashMap::new(),
            shared: DashMap::new(),
            per_node_subscribers: RwLock::new(Vec::new()),
            shared_subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            clock,
        })
    }

    /// True when `incoming` should replace `current` under last-writer-wins.
    fn supersedes_per_node(incoming: &PerNodeDatum, current: &PerNodeDatum) -> bool {
        incoming.timestamp > current.timestamp
            || (incoming.timestamp == current.timestamp
                && incoming.payload.fingerprint() > current.payload.fingerprint())
    }

    fn supersedes_shared(incoming: &SharedDatum, current: &SharedDatum) -> bool {
        incoming.timestamp > current.timestamp
            || (incoming.timestamp == current.timestamp
                && incoming.payload.fingerprint() > current.payload.fingerprint())
    }

    /// Stores a per-node datum if it wins against the current entry.
    pub fn add_per_node(&self, datum: PerNodeDatum) {
        let node_map = self.per_node.entry(datum.node_id.clone()).or_default();
        let outcome = match node_map.entry(datum.key.clone()) {
            Entry::Occupied(mut occupied) => {
                if Self::supersedes_per_node(&datum, occupied.get()) {
                    let old = occupied.insert(datum.clone());
                    Some((Some(old), datum))
                } else {
                    None
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(datum.clone());
                Some((None, datum))
            }
        };
        drop(node_map);
        if let Some((old, new)) = outcome {
            self.notify_per_node(&new.node_id, &new.key, old.as_ref(), Some(&new));
        }
    }

    /// Stores a shared datum: CRDT payloads are merged, everything else is
    /// last-writer-wins.
    pub fn add_shared(&self, datum: SharedDatum) {
        if datum.payload.as_crdt().is_some() {
            self.merge(datum);
            return;
        }
        let outcome = match self.shared.entry(datum.key.clone()) {
            Entry::Occupied(mut occupied) => {
                if Self::supersedes_shared(&datum, occupied.get()) {
                    let old = occupied.insert(datum.clone());
                    Some((Some(old), datum))
                } else {
                    None
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(datum.clone());
                Some((None, datum))
            }
        };
        if let Some((old, new)) = outcome {
            self.notify_shared(&new.key, old.as_ref(), Some(&new));
        }
    }

    /// CRDT merge path. Holds the per-key entry guard for the whole
    /// read-modify-write, so concurrent merges of one key serialize.
    /// Returns the stored CRDT when the operation resolved to one.
    pub fn merge(&self, datum: SharedDatum) -> Option<CrdtValue> {
        let key = datum.key.clone();
        let outcome = match self.shared.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let merged = {
                    let current = occupied.get();
                    match (&current.payload, datum.payload.as_crdt()) {
                        (Payload::Crdt(current_value), Some(incoming_value)) => {
                            Some(SharedDatum {
                                key: key.clone(),
                                node_id: datum.node_id.clone(),
                                timestamp: current.timestamp.max(datum.timestamp),
                                expire_at: max_expiry(current.expire_at, datum.expire_at),
                                payload: Payload::Crdt(current_value.merge(incoming_value)),
                            })
                        }
                        // Current entry is not a CRDT; fall back to timestamps.
                        _ => None,
                    }
                };
                match merged {
                    Some(merged) => {
                        let old = occupied.insert(merged.clone());
                        Some((Some(old), merged))
                    }
                    None => {
                        if Self::supersedes_shared(&datum, occupied.get()) {
                            let old = occupied.insert(datum.clone());
                            Some((Some(old), datum))
                        } else {
                            None
                        }
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(datum.clone());
                Some((None, datum))
            }
        };
        match outcome {
            Some((old, new)) => {
                let stored = new.payload.as_crdt().cloned();
                self.notify_shared(&new.key, old.as_ref(), Some(&new));
                stored
            }
            None => self
                .shared
                .get(&key)
                .and_then(|entry| entry.payload.as_crdt().cloned()),
        }
    }

    /// Returns the per-node datum, or `None` when absent or expired.
    pub fn find_per_node(&self, node_id: &NodeId, key: &str) -> Option<PerNodeDatum> {
        let now_ms = self.clock.now_ms();
        let node_map = self.per_node.get(node_id)?;
        let datum = node_map.get(key)?;
        if datum.expired(now_ms) {
            None
        } else {
            Some(datum.clone())
        }
    }

    /// Returns the shared datum, or `None` when absent or expired.
    pub fn find_shared(&self, key: &str) -> Option<SharedDatum> {
        let now_ms = self.clock.now_ms();
        let datum = self.shared.get(key)?;
        if datum.expired(now_ms) {
            None
        } else {
            Some(datum.clone())
        }
    }

    /// Non-expired per-node data, for outbound gossip and persistence.
    pub fn per_node_snapshot(&self) -> Vec<PerNodeDatum> {
        let now_ms = self.clock.now_ms();
        let mut out = Vec::new();
        for node_map in self.per_node.iter() {
            for datum in node_map.value().iter() {
                if !datum.expired(now_ms) {
                    out.push(datum.clone());
                }
            }
        }
        out
    }

    /// Non-expired shared data, for outbound gossip and persistence.
    pub fn shared_snapshot(&self) -> Vec<SharedDatum> {
        let now_ms = self.clock.now_ms();
        self.shared
            .iter()
            .filter(|entry| !entry.expired(now_ms))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Deletes every entry whose expiry has passed, notifying subscribers
    /// with (old, None). Returns how many entries were removed.
    pub fn reap_expired(&self, now_ms: i64) -> usize {
        let mut removed = 0;

        let mut dead_per_node: Vec<(NodeId, String)> = Vec::new();
        for node_map in self.per_node.iter() {
            for datum in node_map.value().iter() {
                if datum.expired(now_ms) {
                    dead_per_node.push((datum.node_id.clone(), datum.key.clone()));
                }
            }
        }
        for (node_id, key) in dead_per_node {
            if let Some(node_map) = self.per_node.get(&node_id) {
                if let Some((_, old)) =
                    node_map.remove_if(&key, |_, datum| datum.expired(now_ms))
                {
                    removed += 1;
                    self.notify_per_node(&node_id, &key, Some(&old), None);
                }
            }
        }

        let mut dead_shared: Vec<String> = Vec::new();
        for entry in self.shared.iter() {
            if entry.expired(now_ms) {
                dead_shared.push(entry.key.clone());
            }
        }
        for key in dead_shared {
            if let Some((_, old)) = self.shared.remove_if(&key, |_, datum| datum.expired(now_ms)) {
                removed += 1;
                self.notify_shared(&key, Some(&old), None);
            }
        }

        removed
    }

    /// Raw entry counts (including expired, not yet reaped).
    pub fn entry_counts(&self) -> (usize, usize) {
        let per_node = self.per_node.iter().map(|m| m.value().len()).sum();
        (per_node, self.shared.len())
    }

    pub fn register_per_node_subscriber(&self, subscriber: PerNodeSubscriberFn) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.per_node_subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push((id, subscriber));
        id
    }

    pub fn unregister_per_node_subscriber(&self, subscriber_id: u64) {
        self.per_node_subscribers
            .write()
            .expect("subscriber lock poisoned")
            .retain(|(id, _)| *id != subscriber_id);
    }

    pub fn register_shared_subscriber(&self, subscriber: SharedSubscriberFn) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.shared_subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push((id, subscriber));
        id
    }

    pub fn unregister_shared_subscriber(&self, subscriber_id: u64) {
        self.shared_subscribers
            .write()
            .expect("subscriber lock poisoned")
            .retain(|(id, _)| *id != subscriber_id);
    }

    fn notify_per_node(
        &self,
        node_id: &NodeId,
        key: &str,
        old: Option<&PerNodeDatum>,
        new: Option<&PerNodeDatum>,
    ) {
        let subscribers: Vec<PerNodeSubscriberFn> = {
            let guard = self
                .per_node_subscribers
                .read()
                .expect("subscriber lock poisoned");
            guard.iter().map(|(_, s)| s.clone()).collect()
        };
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(node_id, key, old, new))).is_err() {
                tracing::error!("Per-node data subscriber panicked on key {}", key);
            }
        }
    }

    fn notify_shared(&self, key: &str, old: Option<&SharedDatum>, new: Option<&SharedDatum>) {
        let subscribers: Vec<SharedSubscriberFn> = {
            let guard = self
                .shared_subscribers
                .read()
                .expect("subscriber lock poisoned");
            guard.iter().map(|(_, s)| s.clone()).collect()
        };
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(key, old, new))).is_err() {
                tracing::error!("Shared data subscriber panicked on key {}", key);
            }
        }
    }
}
