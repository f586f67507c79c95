//! Periodic member state refresh.
//!
//! Recomputes phi for every known peer at a fixed cadence and flips table
//! state accordingly. Peers the failure detector has never heard from are
//! left alone, so seeded peers stay DOWN until their first heartbeat.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::membership::failure_detector::FailureDetector;
use crate::membership::table::MembershipTable;
use crate::membership::types::PeerState;
use crate::time::Clock;

pub struct StateRefresher {
    table: Arc<MembershipTable>,
    detector: Arc<FailureDetector>,
    clock: Arc<dyn Clock>,
    conviction_threshold: f64,
    interval: Duration,
}

impl StateRefresher {
    pub fn new(
        table: Arc<MembershipTable>,
        detector: Arc<FailureDetector>,
        clock: Arc<dyn Clock>,
        conviction_threshold: f64,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            table,
            detector,
            clock,
            conviction_threshold,
            interval,
        })
    }

    /// Spawns the refresh loop; it exits when `shutdown` flips to true.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let refresher = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresher.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => refresher.refresh_once(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One refresh pass over every known peer.
    pub fn refresh_once(&self) {
        let now_ns = self.clock.now_ns();
        for (member, _state) in self.table.snapshot_all() {
            let Some(phi) = self.detector.phi(&member.id, now_ns) else {
                continue;
            };
            let next = if phi < self.conviction_threshold {
                PeerState::Up
            } else {
                PeerState::Down
            };
            self.table.set_state(&member.id, next);
        }
    }
}
