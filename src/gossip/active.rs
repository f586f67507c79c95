//! Outbound gossip.
//!
//! A `GossipCourier` owns the mechanics every gossiper needs: advancing the
//! local heartbeat, snapshotting state, picking a partner uniformly at
//! random and pushing encoded messages through the transport. The two
//! `ActiveGossiper` implementations only differ in how they schedule pushes
//! and which candidate sets they draw partners from; both compose the
//! courier by delegation.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::config::TopologyIntervals;
use crate::data::store::DataStore;
use crate::gossip::messages::GossipMessage;
use crate::gossip::worker_pool::WorkerPool;
use crate::membership::table::MembershipTable;
use crate::membership::types::Member;
use crate::protocol::ProtocolCodec;
use crate::time::Clock;
use crate::transport::Transport;

/// Queue capacity for pending pushes.
pub const WORK_QUEUE_CAPACITY: usize = 1024;
/// Workers draining the push queue.
pub const MAX_WORKERS: usize = 30;
/// Grace period for draining pushes at shutdown.
pub const POOL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Which slice of state a scheduled push carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    MembershipList,
    PerNodeData,
    SharedData,
}

/// Topology tier a partner is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    SameRack,
    SameDcDifferentRack,
    DifferentDatacenter,
}

/// Periodic gossip strategy held by the engine.
pub trait ActiveGossiper: Send + Sync {
    /// Spawns the periodic push tasks.
    fn start(&self);

    /// Stops the schedule, drains pending pushes and tells a sample of live
    /// peers we are leaving.
    fn shutdown<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Live members in the local member's rack (excluding itself). Empty when
/// the local member lacks either topology tag.
pub fn same_rack(local: &Member, live: &[Member]) -> Vec<Member> {
    let (Some(dc), Some(rack)) = (local.datacenter(), local.rack()) else {
        return Vec::new();
    };
    live.iter()
        .filter(|m| m.datacenter() == Some(dc) && m.rack() == Some(rack))
        .cloned()
        .collect()
}

/// Live members in the same datacenter but a different rack.
pub fn same_dc_different_rack(local: &Member, live: &[Member]) -> Vec<Member> {
    let (Some(dc), Some(rack)) = (local.datacenter(), local.rack()) else {
        return Vec::new();
    };
    live.iter()
        .filter(|m| m.datacenter() == Some(dc) && m.rack() != Some(rack))
        .cloned()
        .collect()
}

/// Live members outside the local member's datacenter.
pub fn different_datacenter(local: &Member, live: &[Member]) -> Vec<Member> {
    let (Some(dc), Some(_rack)) = (local.datacenter(), local.rack()) else {
        return Vec::new();
    };
    live.iter()
        .filter(|m| m.datacenter() != Some(dc))
        .cloned()
        .collect()
}

/// Uniform random pick from a candidate list.
pub fn select_partner(candidates: &[Member]) -> Option<Member> {
    if candidates.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..candidates.len());
    Some(candidates[index].clone())
}

/// Shared push mechanics used by every gossiper implementation.
pub struct GossipCourier {
    table: Arc<MembershipTable>,
    store: Arc<DataStore>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn ProtocolCodec>,
    clock: Arc<dyn Clock>,
    local: Arc<RwLock<Member>>,
}

impl GossipCourier {
    pub fn new(
        table: Arc<MembershipTable>,
        store: Arc<DataStore>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn ProtocolCodec>,
        clock: Arc<dyn Clock>,
        local: Arc<RwLock<Member>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            table,
            store,
            transport,
            codec,
            clock,
            local,
        })
    }

    /// Bumps the local heartbeat to the monotonic clock and returns the
    /// member to advertise.
    fn advance_local_heartbeat(&self) -> Member {
        let mut local = self.local.write().expect("local member lock poisoned");
        local.heartbeat = self.clock.now_ns();
        local.clone()
    }

    fn local_snapshot(&self) -> Member {
        self.local.read().expect("local member lock poisoned").clone()
    }

    async fn send(&self, target: &Member, message: GossipMessage) {
        let bytes = match self.codec.encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode {} message: {}", message.kind(), e);
                return;
            }
        };
        if let Err(e) = self.transport.send(&target.endpoint, bytes).await {
            tracing::warn!(
                "Failed to send {} to {} at {}: {}",
                message.kind(),
                target.id,
                target.endpoint,
                e
            );
        }
    }

    pub async fn send_membership_list(&self, target: &Member) {
        let from = self.advance_local_heartbeat();
        let members = self.table.snapshot_live();
        self.send(target, GossipMessage::MembershipList { from, members })
            .await;
    }

    pub async fn send_per_node_data(&self, target: &Member) {
        self.advance_local_heartbeat();
        for datum in self.store.per_node_snapshot() {
            self.send(target, GossipMessage::PerNodeData(datum)).await;
        }
    }

    pub async fn send_shared_data(&self, target: &Member) {
        self.advance_local_heartbeat();
        for datum in self.store.shared_snapshot() {
            self.send(target, GossipMessage::SharedData(datum)).await;
        }
    }

    pub async fn send_shutdown(&self, target: &Member) {
        let node_id = self.local_snapshot().id;
        self.send(target, GossipMessage::Shutdown { node_id }).await;
    }

    /// Picks a partner from the tier's candidate set (computed fresh from
    /// the live snapshot) and pushes the requested slice to it.
    pub async fn push_to_tier(&self, tier: Tier, kind: PushKind) {
        let local = self.local_snapshot();
        let live = self.table.snapshot_live();
        let candidates = match tier {
            Tier::SameRack => same_rack(&local, &live),
            Tier::SameDcDifferentRack => same_dc_different_rack(&local, &live),
            Tier::DifferentDatacenter => different_datacenter(&local, &live),
        };
        if let Some(partner) = select_partner(&candidates) {
            self.push(&partner, kind).await;
        }
    }

    /// Pushes to a random live member regardless of topology.
    pub async fn push_to_any_live(&self, kind: PushKind) {
        let live = self.table.snapshot_live();
        if let Some(partner) = select_partner(&live) {
            self.push(&partner, kind).await;
        }
    }

    /// Pings a random DOWN member with our membership view so it can
    /// rejoin once reachable again.
    pub async fn push_to_dead(&self) {
        let dead = self.table.snapshot_dead();
        if let Some(partner) = select_partner(&dead) {
            self.send_membership_list(&partner).await;
        }
    }

    async fn push(&self, partner: &Member, kind: PushKind) {
        match kind {
            PushKind::MembershipList => self.send_membership_list(partner).await,
            PushKind::PerNodeData => self.send_per_node_data(partner).await,
            PushKind::SharedData => self.send_shared_data(partner).await,
        }
    }

    /// Optimistic shutdown fan-out to max(1, live/3) random live peers.
    pub async fn broadcast_shutdown(&self) {
        let live = self.table.snapshot_live();
        if live.is_empty() {
            return;
        }
        let send_to = (live.len() / 3).max(1);
        for _ in 0..send_to {
            if let Some(partner) = select_partner(&live) {
                self.send_shutdown(&partner).await;
            }
        }
    }
}

/// Common scheduling skeleton: spawned interval tasks that enqueue pushes
/// on the worker pool until the shutdown signal flips.
struct GossipSchedule {
    pool: Arc<WorkerPool>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl GossipSchedule {
    fn new(pool: Arc<WorkerPool>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pool,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn spawn<F, Fut>(&self, period: Duration, make_job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pool = self.pool.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.submit(make_job());
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().expect("task list lock poisoned").push(handle);
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<tokio::task::JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.pool.shutdown(POOL_SHUTDOWN_GRACE).await;
    }
}

/// Topology-unaware gossiper: one period for everything.
pub struct SimpleActiveGossiper {
    courier: Arc<GossipCourier>,
    schedule: GossipSchedule,
    gossip_interval: Duration,
}

impl SimpleActiveGossiper {
    pub fn new(
        courier: Arc<GossipCourier>,
        pool: Arc<WorkerPool>,
        gossip_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            courier,
            schedule: GossipSchedule::new(pool),
            gossip_interval,
        })
    }
}

impl ActiveGossiper for SimpleActiveGossiper {
    fn start(&self) {
        self.schedule.pool.clone().start();
        for kind in [PushKind::MembershipList, PushKind::PerNodeData, PushKind::SharedData] {
            let courier = self.courier.clone();
            self.schedule.spawn(self.gossip_interval, move || {
                let courier = courier.clone();
                async move { courier.push_to_any_live(kind).await }
            });
        }
        let courier = self.courier.clone();
        self.schedule.spawn(self.gossip_interval, move || {
            let courier = courier.clone();
            async move { courier.push_to_dead().await }
        });
        tracing::debug!(
            "Simple active gossiper started (period {:?})",
            self.gossip_interval
        );
    }

    fn shutdown<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.schedule.stop().await;
            self.courier.broadcast_shutdown().await;
        })
    }
}

/// Sends gossip traffic at different rates to the local rack, the local
/// datacenter and remote datacenters, plus a slow ping to DOWN members.
/// A node without both topology tags schedules the same tasks but their
/// candidate sets are always empty.
pub struct DatacenterRackAwareGossiper {
    courier: Arc<GossipCourier>,
    schedule: GossipSchedule,
    intervals: TopologyIntervals,
}

impl DatacenterRackAwareGossiper {
    pub fn new(
        courier: Arc<GossipCourier>,
        pool: Arc<WorkerPool>,
        intervals: TopologyIntervals,
    ) -> Arc<Self> {
        Arc::new(Self {
            courier,
            schedule: GossipSchedule::new(pool),
            intervals,
        })
    }

    fn spawn_tier(&self, tier: Tier, period_ms: u64) {
        for kind in [PushKind::MembershipList, PushKind::PerNodeData, PushKind::SharedData] {
            let courier = self.courier.clone();
            self.schedule
                .spawn(Duration::from_millis(period_ms), move || {
                    let courier = courier.clone();
                    async move { courier.push_to_tier(tier, kind).await }
                });
        }
    }
}

impl ActiveGossiper for DatacenterRackAwareGossiper {
    fn start(&self) {
        self.schedule.pool.clone().start();
        self.spawn_tier(Tier::SameRack, self.intervals.same_rack_ms);
        self.spawn_tier(Tier::SameDcDifferentRack, self.intervals.same_dc_ms);
        self.spawn_tier(Tier::DifferentDatacenter, self.intervals.different_dc_ms);

        let courier = self.courier.clone();
        self.schedule.spawn(
            Duration::from_millis(self.intervals.dead_member_ms),
            move || {
                let courier = courier.clone();
                async move { courier.push_to_dead().await }
            },
        );
        tracing::debug!(
            "Datacenter/rack-aware gossiper started (rack {} ms, dc {} ms, remote {} ms, dead {} ms)",
            self.intervals.same_rack_ms,
            self.intervals.same_dc_ms,
            self.intervals.different_dc_ms,
            self.intervals.dead_member_ms
        );
    }

    fn shutdown<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.schedule.stop().await;
            self.courier.broadcast_shutdown().await;
        })
    }
}
