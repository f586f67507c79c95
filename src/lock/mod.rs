//! Distributed locks over shared data.
//!
//! Locking a key gossips a `MajorityVote` ballot under `lock.<key>`. Every
//! node that observes the ballot adds an affirmative vote through the CRDT
//! merge path, so votes accumulate no matter the delivery order. The
//! requester waits a bounded window and acquires the lock only when a
//! majority of the cluster (live members plus itself) has voted; otherwise
//! the attempt fails with `VoteFailed`. Both sides of the quorum check are
//! recomputed from the live snapshot on every poll: a peer that goes DOWN
//! neither counts toward the quorum size nor keeps its earlier vote. This
//! is optimistic coordination, not strong consensus: a partitioned
//! minority can never acquire.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::LockSettings;
use crate::data::crdt::CrdtValue;
use crate::data::store::DataStore;
use crate::data::types::{Payload, SharedDatum};
use crate::error::{GossipError, GossipResult};
use crate::membership::table::MembershipTable;
use crate::membership::types::{Member, NodeId};
use crate::time::Clock;

const LOCK_KEY_PREFIX: &str = "lock.";

pub struct LockManager {
    store: Arc<DataStore>,
    table: Arc<MembershipTable>,
    clock: Arc<dyn Clock>,
    local_id: NodeId,
    settings: LockSettings,
    subscriber_id: Mutex<Option<u64>>,
}

impl LockManager {
    pub fn new(
        store: Arc<DataStore>,
        table: Arc<MembershipTable>,
        clock: Arc<dyn Clock>,
        local_id: NodeId,
        settings: LockSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            table,
            clock,
            local_id,
            settings,
            subscriber_id: Mutex::new(None),
        })
    }

    /// Registers the voter: every observed ballot we have not voted on yet
    /// gets our affirmative vote merged in.
    pub fn start(self: Arc<Self>) {
        let manager = self.clone();
        let id = self.store.register_shared_subscriber(Arc::new(move |key, _old, new| {
            if !key.starts_with(LOCK_KEY_PREFIX) {
                return;
            }
            let Some(datum) = new else {
                return;
            };
            let Payload::Crdt(CrdtValue::MajorityVote(votes)) = &datum.payload else {
                return;
            };
            if votes.contains_key(&manager.local_id.0) {
                return;
            }
            manager.store.merge(manager.ballot(key, datum.expire_at));
        }));
        *self.subscriber_id.lock().expect("subscriber id lock poisoned") = Some(id);
    }

    pub fn shutdown(&self) {
        if let Some(id) = self
            .subscriber_id
            .lock()
            .expect("subscriber id lock poisoned")
            .take()
        {
            self.store.unregister_shared_subscriber(id);
        }
    }

    fn ballot(&self, vote_key: &str, expire_at: Option<i64>) -> SharedDatum {
        let mut votes = BTreeMap::new();
        votes.insert(self.local_id.0.clone(), true);
        SharedDatum {
            key: vote_key.to_string(),
            node_id: self.local_id.clone(),
            timestamp: self.clock.now_ms(),
            expire_at,
            payload: Payload::Crdt(CrdtValue::MajorityVote(votes)),
        }
    }

    /// Affirmative votes cast by this node or a currently live member.
    /// Votes from peers that have since gone DOWN are not counted.
    fn affirmative_votes(&self, vote_key: &str, live: &[Member]) -> usize {
        match self.store.find_shared(vote_key) {
            Some(SharedDatum {
                payload: Payload::Crdt(CrdtValue::MajorityVote(votes)),
                ..
            }) => votes
                .iter()
                .filter(|&(voter, &vote)| {
                    vote
                        && (*voter == self.local_id.0
                            || live.iter().any(|member| member.id.0 == *voter))
                })
                .count(),
            _ => 0,
        }
    }

    /// Tries to acquire the lock for `key` within the configured window.
    pub async fn acquire_shared_data_lock(&self, key: &str) -> GossipResult<()> {
        let vote_key = format!("{}{}", LOCK_KEY_PREFIX, key);
        let expire_at = Some(self.clock.now_ms() + self.settings.vote_ttl_ms);
        let deadline = self.clock.now_ms() + self.settings.vote_wait_ms as i64;

        // Cast our own vote; the active gossiper spreads the ballot from
        // the shared map.
        self.store.merge(self.ballot(&vote_key, expire_at));

        loop {
            // Quorum over the nodes that can actually vote right now:
            // live members plus ourselves.
            let live = self.table.snapshot_live();
            let cluster_size = live.len() + 1;
            let votes = self.affirmative_votes(&vote_key, &live);
            if votes * 2 > cluster_size {
                tracing::debug!(
                    "Acquired lock on {} with {}/{} votes",
                    key,
                    votes,
                    cluster_size
                );
                return Ok(());
            }
            if self.clock.now_ms() >= deadline {
                tracing::warn!(
                    "Lock vote on {} failed: {}/{} votes before deadline",
                    key,
                    votes,
                    cluster_size
                );
                return Err(GossipError::VoteFailed(key.to_string()));
            }
            // Re-assert the ballot so late joiners see it.
            self.store.merge(self.ballot(&vote_key, expire_at));
            tokio::time::sleep(Duration::from_millis(self.settings.vote_update_ms)).await;
        }
    }
}
