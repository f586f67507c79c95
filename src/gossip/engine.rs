//! Engine composition root.
//!
//! Wires the membership table, data store, failure detector, dispatcher,
//! transport, active gossiper, reaper, refresher, persisters and lock
//! manager together, and owns the lifecycle: everything is acquired in
//! `start` and released in `stop`, which is safe to call repeatedly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;

use crate::config::{GossipSettings, TopologyIntervals};
use crate::data::crdt::CrdtValue;
use crate::data::reaper::Reaper;
use crate::data::store::{DataStore, PerNodeSubscriberFn, SharedSubscriberFn};
use crate::data::types::{Payload, PerNodeDatum, SharedDatum};
use crate::error::{GossipError, GossipResult};
use crate::gossip::active::{
    ActiveGossiper, DatacenterRackAwareGossiper, GossipCourier, SimpleActiveGossiper, MAX_WORKERS,
    WORK_QUEUE_CAPACITY,
};
use crate::gossip::dispatcher::MessageDispatcher;
use crate::gossip::worker_pool::WorkerPool;
use crate::lock::LockManager;
use crate::membership::failure_detector::FailureDetector;
use crate::membership::refresher::StateRefresher;
use crate::membership::table::{GossipListenerFn, MembershipTable};
use crate::membership::types::{Endpoint, Member, NodeId, PeerState};
use crate::persistence::{
    per_node_data_path, ring_state_path, shared_data_path, RingStatePersister, UserDataPersister,
    PERSIST_INTERVAL_SECS,
};
use crate::protocol::ProtocolRegistry;
use crate::time::{Clock, SystemClock};
use crate::transport::{Transport, TransportContext, TransportRegistry};

/// Grace period for the periodic tasks at shutdown.
const SCHEDULER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Everything that only exists while the engine runs.
struct RunningState {
    transport: Arc<dyn Transport>,
    gossiper: Arc<dyn ActiveGossiper>,
    shutdown_tx: watch::Sender<bool>,
    task_handles: Vec<tokio::task::JoinHandle<()>>,
    event_pump: tokio::task::JoinHandle<()>,
}

pub struct GossipEngine {
    settings: GossipSettings,
    clock: Arc<dyn Clock>,
    local: Arc<RwLock<Member>>,
    local_id: NodeId,
    detector: Arc<FailureDetector>,
    table: Arc<MembershipTable>,
    store: Arc<DataStore>,
    lock_manager: Arc<LockManager>,
    running: AtomicBool,
    running_state: tokio::sync::Mutex<Option<RunningState>>,
}

impl GossipEngine {
    pub fn new(
        cluster: impl Into<String>,
        id: NodeId,
        endpoint: Endpoint,
        properties: BTreeMap<String, String>,
        seeds: Vec<Member>,
        settings: GossipSettings,
    ) -> Arc<Self> {
        Self::with_clock(
            cluster,
            id,
            endpoint,
            properties,
            seeds,
            settings,
            Arc::new(SystemClock::new()),
        )
    }

    pub fn with_clock(
        cluster: impl Into<String>,
        id: NodeId,
        endpoint: Endpoint,
        properties: BTreeMap<String, String>,
        seeds: Vec<Member>,
        settings: GossipSettings,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let cluster = cluster.into();
        let local = Member::new(cluster.clone(), id.clone(), endpoint, properties);
        let detector = Arc::new(FailureDetector::new(
            settings.window_size,
            settings.minimum_samples,
            settings.distribution,
        ));
        let table = MembershipTable::new(&local, detector.clone());
        table.seed(seeds);
        let store = DataStore::new(clock.clone());
        let lock_manager = LockManager::new(
            store.clone(),
            table.clone(),
            clock.clone(),
            id.clone(),
            settings.lock.clone(),
        );

        let engine = Arc::new(Self {
            settings,
            clock,
            local: Arc::new(RwLock::new(local)),
            local_id: id,
            detector,
            table,
            store,
            lock_manager,
            running: AtomicBool::new(false),
            running_state: tokio::sync::Mutex::new(None),
        });
        engine.load_saved_state(&cluster);
        engine
    }

    /// Reloads the ring and user data a previous run persisted.
    fn load_saved_state(&self, cluster: &str) {
        let dir = self.settings.path_to_state.clone();
        if self.settings.persist_ring_state {
            let path = ring_state_path(&dir, cluster, &self.local_id.0);
            let saved = RingStatePersister::read_from_disk(&path);
            if !saved.is_empty() {
                tracing::info!("Restored {} members from {:?}", saved.len(), path);
                self.table.seed(saved);
            }
        }
        if self.settings.persist_data_state {
            let per_node_path = per_node_data_path(&dir, cluster, &self.local_id.0);
            for datum in UserDataPersister::read_per_node_from_disk(&per_node_path) {
                self.store.add_per_node(datum);
            }
            let shared_path = shared_data_path(&dir, cluster, &self.local_id.0);
            for datum in UserDataPersister::read_shared_from_disk(&shared_path) {
                self.store.add_shared(datum);
            }
        }
    }

    /// Starts the transport, the gossip schedule and every periodic task.
    pub async fn start(&self) -> GossipResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let local = self.self_member();

        let codec = ProtocolRegistry::with_defaults()
            .build(&self.settings.protocol)
            .map_err(|e| GossipError::TransportUnavailable(e.to_string()))?;
        let dispatcher = MessageDispatcher::new(
            self.table.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.local_id.clone(),
        );
        let transport = TransportRegistry::with_defaults()
            .build(
                &self.settings.transport,
                TransportContext {
                    bind: local.endpoint.clone(),
                    dispatcher,
                    codec: codec.clone(),
                },
            )
            .await
            .map_err(|e| GossipError::TransportUnavailable(e.to_string()))?;
        transport
            .start_endpoint()
            .await
            .map_err(|e| GossipError::TransportUnavailable(e.to_string()))?;

        let pool = WorkerPool::new(WORK_QUEUE_CAPACITY, MAX_WORKERS);
        let courier = GossipCourier::new(
            self.table.clone(),
            self.store.clone(),
            transport.clone(),
            codec,
            self.clock.clone(),
            self.local.clone(),
        );
        let gossiper = self.build_gossiper(courier, pool);
        gossiper.start();

        let event_pump = self.table.clone().start_event_pump();
        self.lock_manager.clone().start();

        let (shutdown_tx, _) = watch::channel(false);
        let mut task_handles = Vec::new();

        let reaper = Reaper::new(
            self.store.clone(),
            self.clock.clone(),
            Duration::from_millis(self.settings.reaper_interval_ms),
        );
        task_handles.push(reaper.start(shutdown_tx.subscribe()));

        let refresher = StateRefresher::new(
            self.table.clone(),
            self.detector.clone(),
            self.clock.clone(),
            self.settings.conviction_threshold,
            Duration::from_millis(self.settings.gossip_interval_ms),
        );
        task_handles.push(refresher.start(shutdown_tx.subscribe()));

        task_handles.extend(self.start_persisters(&local.cluster, shutdown_tx.subscribe()));

        *self.running_state.lock().await = Some(RunningState {
            transport,
            gossiper,
            shutdown_tx,
            task_handles,
            event_pump,
        });
        tracing::info!("Gossip engine started as {} in {}", self.local_id, local.cluster);
        Ok(())
    }

    fn build_gossiper(
        &self,
        courier: Arc<GossipCourier>,
        pool: Arc<WorkerPool>,
    ) -> Arc<dyn ActiveGossiper> {
        let gossiper: Arc<dyn ActiveGossiper> = match self.settings.active_gossiper.as_str() {
            "simple" => SimpleActiveGossiper::new(
                courier,
                pool,
                Duration::from_millis(self.settings.gossip_interval_ms),
            ),
            name => {
                if name != "datacenter-rack-aware" {
                    tracing::warn!(
                        "Unknown active gossiper {:?}; using datacenter-rack-aware",
                        name
                    );
                }
                DatacenterRackAwareGossiper::new(
                    courier,
                    pool,
                    TopologyIntervals::from_properties(&self.settings.active_gossip_properties),
                )
            }
        };
        gossiper
    }

    fn start_persisters(
        &self,
        cluster: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        let dir = self.settings.path_to_state.clone();
        let period = Duration::from_secs(PERSIST_INTERVAL_SECS);

        if self.settings.persist_ring_state {
            let persister = RingStatePersister::new(
                ring_state_path(&dir, cluster, &self.local_id.0),
                self.table.clone(),
            );
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await; // fires immediately; skip the zeroth
                loop {
                    tokio::select! {
                        _ = ticker.tick() => persister.write(),
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }
        if self.settings.persist_data_state {
            let persister = UserDataPersister::new(
                per_node_data_path(&dir, cluster, &self.local_id.0),
                shared_data_path(&dir, cluster, &self.local_id.0),
                self.store.clone(),
            );
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => persister.write(),
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }
        handles
    }

    /// Stops every component. Idempotent: later calls are no-ops.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(state) = self.running_state.lock().await.take() else {
            return;
        };
        self.lock_manager.shutdown();
        // The gossiper drains its pool and broadcasts shutdown while the
        // transport can still send.
        state.gossiper.shutdown().await;
        state.transport.shutdown().await;

        let _ = state.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + SCHEDULER_SHUTDOWN_GRACE;
        for mut handle in state.task_handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        state.event_pump.abort();
        tracing::info!("Gossip engine {} stopped", self.local_id);
    }

    fn ensure_running(&self) -> GossipResult<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GossipError::NotRunning)
        }
    }

    fn validate_key_and_timestamp(key: &str, timestamp: i64) -> GossipResult<()> {
        if key.is_empty() {
            return Err(GossipError::invalid_payload("empty key"));
        }
        if timestamp <= 0 {
            return Err(GossipError::invalid_payload("missing timestamp"));
        }
        Ok(())
    }

    /// Publishes a per-node datum under this node's id.
    pub fn gossip_per_node_data(&self, mut datum: PerNodeDatum) -> GossipResult<()> {
        self.ensure_running()?;
        Self::validate_key_and_timestamp(&datum.key, datum.timestamp)?;
        datum.node_id = self.local_id.clone();
        self.store.add_per_node(datum);
        Ok(())
    }

    /// Publishes a shared datum, recording this node as the writer.
    pub fn gossip_shared_data(&self, mut datum: SharedDatum) -> GossipResult<()> {
        self.ensure_running()?;
        Self::validate_key_and_timestamp(&datum.key, datum.timestamp)?;
        datum.node_id = self.local_id.clone();
        self.store.add_shared(datum);
        Ok(())
    }

    /// Looks up a shared CRDT; `None` when absent, expired, or not a CRDT.
    pub fn find_crdt(&self, key: &str) -> GossipResult<Option<CrdtValue>> {
        self.ensure_running()?;
        Ok(self
            .store
            .find_shared(key)
            .and_then(|datum| datum.payload.as_crdt().cloned()))
    }

    /// Merges a CRDT payload into the shared store and returns the merged
    /// value. Fails with `InvalidPayload` when the payload (or the value
    /// already stored under the key) is not a CRDT.
    pub fn merge(&self, mut datum: SharedDatum) -> GossipResult<CrdtValue> {
        self.ensure_running()?;
        Self::validate_key_and_timestamp(&datum.key, datum.timestamp)?;
        if !matches!(datum.payload, Payload::Crdt(_)) {
            return Err(GossipError::invalid_payload("payload is not a CRDT"));
        }
        datum.node_id = self.local_id.clone();
        self.store
            .merge(datum)
            .ok_or_else(|| GossipError::invalid_payload("stored value is not a CRDT"))
    }

    pub fn find_per_node_gossip_data(
        &self,
        node_id: &NodeId,
        key: &str,
    ) -> GossipResult<Option<PerNodeDatum>> {
        self.ensure_running()?;
        Ok(self.store.find_per_node(node_id, key))
    }

    pub fn find_shared_gossip_data(&self, key: &str) -> GossipResult<Option<SharedDatum>> {
        self.ensure_running()?;
        Ok(self.store.find_shared(key))
    }

    /// Tries to acquire the cluster-wide lock for a shared-data key.
    pub async fn acquire_shared_data_lock(&self, key: &str) -> GossipResult<()> {
        self.ensure_running()?;
        self.lock_manager.acquire_shared_data_lock(key).await
    }

    pub fn live_members(&self) -> Vec<Member> {
        self.table.snapshot_live()
    }

    pub fn dead_members(&self) -> Vec<Member> {
        self.table.snapshot_dead()
    }

    pub fn self_member(&self) -> Member {
        self.local.read().expect("local member lock poisoned").clone()
    }

    pub fn register_gossip_listener(&self, listener: GossipListenerFn) -> u64 {
        self.table.register_listener(listener)
    }

    pub fn unregister_gossip_listener(&self, listener_id: u64) {
        self.table.unregister_listener(listener_id)
    }

    pub fn register_per_node_data_subscriber(&self, subscriber: PerNodeSubscriberFn) -> u64 {
        self.store.register_per_node_subscriber(subscriber)
    }

    pub fn unregister_per_node_data_subscriber(&self, subscriber_id: u64) {
        self.store.unregister_per_node_subscriber(subscriber_id)
    }

    pub fn register_shared_data_subscriber(&self, subscriber: SharedSubscriberFn) -> u64 {
        self.store.register_shared_subscriber(subscriber)
    }

    pub fn unregister_shared_data_subscriber(&self, subscriber_id: u64) {
        self.store.unregister_shared_subscriber(subscriber_id)
    }

    /// Every known peer with its current state, in table order.
    pub fn membership_snapshot(&self) -> Vec<(Member, PeerState)> {
        self.table.snapshot_all()
    }
}
