//! Ordered membership table with UP/DOWN listeners.
//!
//! The table is a `BTreeMap` keyed on (cluster, node id) so every node walks
//! members in the same order. Reads hand out cloned snapshots; writers take
//! the lock briefly. The local member is never stored here.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

use crate::membership::failure_detector::FailureDetector;
use crate::membership::types::{Member, MemberKey, NodeId, PeerState};

/// Callback invoked on every UP/DOWN transition.
pub type GossipListenerFn = Arc<dyn Fn(&Member, PeerState) + Send + Sync>;

struct MemberEntry {
    member: Member,
    state: PeerState,
}

pub struct MembershipTable {
    members: RwLock<BTreeMap<MemberKey, MemberEntry>>,
    detector: Arc<FailureDetector>,
    listeners: RwLock<Vec<(u64, GossipListenerFn)>>,
    next_listener_id: AtomicU64,
    events_tx: RwLock<mpsc::UnboundedSender<(Member, PeerState)>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<(Member, PeerState)>>>,
    local_key: MemberKey,
}

impl MembershipTable {
    pub fn new(local: &Member, detector: Arc<FailureDetector>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            members: RwLock::new(BTreeMap::new()),
            detector,
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            events_tx: RwLock::new(events_tx),
            events_rx: Mutex::new(Some(events_rx)),
            local_key: local.key(),
        })
    }

    /// Inserts bootstrap members in the DOWN state. The local member and
    /// duplicates are skipped; existing entries are left untouched.
    pub fn seed(&self, seeds: Vec<Member>) {
        let mut members = self.members.write().expect("membership lock poisoned");
        for mut seed in seeds {
            let key = seed.key();
            if key == self.local_key {
                continue;
            }
            seed.heartbeat = 0;
            members.entry(key).or_insert(MemberEntry {
                member: seed,
                state: PeerState::Down,
            });
        }
    }

    /// Applies one inbound membership advertisement.
    ///
    /// Unknown peers are inserted DOWN. A known peer only advances on a
    /// strictly greater heartbeat, which also counts as an arrival for the
    /// failure detector; stale heartbeats are dropped so the stored counter
    /// never decreases.
    pub fn upsert_from_heartbeat(&self, member: &Member, heartbeat: i64, now_ns: i64) {
        let key = member.key();
        if key == self.local_key {
            return;
        }
        let advanced = {
            let mut members = self.members.write().expect("membership lock poisoned");
            match members.get_mut(&key) {
                Some(entry) => {
                    if heartbeat > entry.member.heartbeat {
                        entry.member.heartbeat = heartbeat;
                        if entry.member.properties != member.properties {
                            entry.member.properties = member.properties.clone();
                        }
                        true
                    } else {
                        tracing::trace!(
                            "Ignoring stale heartbeat {} for {} (stored {})",
                            heartbeat,
                            key.id,
                            entry.member.heartbeat
                        );
                        false
                    }
                }
                None => {
                    tracing::debug!("Discovered new member {} via gossip", key.id);
                    let mut inserted = member.clone();
                    inserted.heartbeat = heartbeat;
                    members.insert(
                        key.clone(),
                        MemberEntry {
                            member: inserted,
                            state: PeerState::Down,
                        },
                    );
                    false
                }
            }
        };
        if advanced {
            self.detector.report(&key.id, now_ns);
        }
    }

    /// Sets a peer's state, emitting a listener event when it changed.
    pub fn set_state(&self, id: &NodeId, new_state: PeerState) {
        let mut members = self.members.write().expect("membership lock poisoned");
        let changed = members.values_mut().find_map(|entry| {
            if &entry.member.id == id && entry.state != new_state {
                entry.state = new_state;
                Some(entry.member.clone())
            } else {
                None
            }
        });
        drop(members);
        if let Some(member) = changed {
            tracing::info!("Member {} transitioned to {:?}", member.id, new_state);
            let _ = self
                .events_tx
                .read()
                .expect("event sender lock poisoned")
                .send((member, new_state));
        }
    }

    /// Forces a peer DOWN immediately, bypassing the failure detector.
    /// Used for optimistic shutdown notifications.
    pub fn force_down(&self, id: &NodeId) {
        self.set_state(id, PeerState::Down);
    }

    pub fn snapshot_live(&self) -> Vec<Member> {
        self.snapshot_where(PeerState::Up)
    }

    pub fn snapshot_dead(&self) -> Vec<Member> {
        self.snapshot_where(PeerState::Down)
    }

    /// All known peers with their states, in table order.
    pub fn snapshot_all(&self) -> Vec<(Member, PeerState)> {
        self.members
            .read()
            .expect("membership lock poisoned")
            .values()
            .map(|entry| (entry.member.clone(), entry.state))
            .collect()
    }

    fn snapshot_where(&self, state: PeerState) -> Vec<Member> {
        self.members
            .read()
            .expect("membership lock poisoned")
            .values()
            .filter(|entry| entry.state == state)
            .map(|entry| entry.member.clone())
            .collect()
    }

    pub fn heartbeat_of(&self, id: &NodeId) -> Option<i64> {
        self.members
            .read()
            .expect("membership lock poisoned")
            .values()
            .find(|entry| &entry.member.id == id)
            .map(|entry| entry.member.heartbeat)
    }

    pub fn register_listener(&self, listener: GossipListenerFn) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push((id, listener));
        id
    }

    pub fn unregister_listener(&self, listener_id: u64) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .retain(|(id, _)| *id != listener_id);
    }

    /// Starts the single-threaded listener fan-out. Events are delivered in
    /// order; a panicking listener is logged and the rest still run. After a
    /// previous pump was stopped, a fresh channel replaces the old one.
    pub fn start_event_pump(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let stashed = self
            .events_rx
            .lock()
            .expect("event receiver lock poisoned")
            .take();
        let mut events_rx = match stashed {
            Some(events_rx) => events_rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                *self.events_tx.write().expect("event sender lock poisoned") = tx;
                rx
            }
        };
        let table = self;
        tokio::spawn(async move {
            while let Some((member, state)) = events_rx.recv().await {
                let listeners: Vec<GossipListenerFn> = {
                    let guard = table.listeners.read().expect("listener lock poisoned");
                    guard.iter().map(|(_, l)| l.clone()).collect()
                };
                for listener in listeners {
                    let outcome =
                        catch_unwind(AssertUnwindSafe(|| listener(&member, state)));
                    if outcome.is_err() {
                        tracing::error!(
                            "Gossip listener panicked handling {} -> {:?}",
                            member.id,
                            state
                        );
                    }
                }
            }
        })
    }
}
