//! Scheduled eviction of expired payloads.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::data::store::DataStore;
use crate::time::Clock;

pub struct Reaper {
    store: Arc<DataStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<DataStore>, clock: Arc<dyn Clock>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            interval,
        })
    }

    /// Spawns the reap loop; it exits when `shutdown` flips to true.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let reaper = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reaper.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = reaper.store.reap_expired(reaper.clock.now_ms());
                        if removed > 0 {
                            tracing::debug!("Reaped {} expired data entries", removed);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
