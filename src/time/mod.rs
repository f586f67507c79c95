//! Time sources for the gossip core.
//!
//! All inter-arrival statistics use monotonic nanoseconds; all expiry
//! comparisons use wall-clock milliseconds. Components take an
//! `Arc<dyn Clock>` so tests can substitute a manual clock and drive both
//! scales deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic + wall-clock time source.
pub trait Clock: Send + Sync {
    /// Monotonic nanoseconds. Only differences are meaningful.
    fn now_ns(&self) -> i64;

    /// Wall-clock milliseconds since the unix epoch.
    fn now_ms(&self) -> i64;
}

/// Production clock backed by `Instant` and `SystemTime`.
///
/// `now_ns` is anchored to the wall clock at construction and advanced by a
/// monotonic `Instant`, so heartbeat counters keep growing across process
/// restarts while staying immune to wall-clock steps within a run.
pub struct SystemClock {
    origin: Instant,
    base_ns: i64,
}

impl SystemClock {
    pub fn new() -> Self {
        let base_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;
        Self {
            origin: Instant::now(),
            base_ns,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ns(&self) -> i64 {
        self.base_ns + self.origin.elapsed().as_nanos() as i64
    }

    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Hand-cranked clock for tests. Both scales advance independently.
pub struct ManualClock {
    ns: AtomicI64,
    ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ns: i64, start_ms: i64) -> Self {
        Self {
            ns: AtomicI64::new(start_ns),
            ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_ns(&self, delta: i64) {
        self.ns.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta: i64) {
        self.ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: i64) {
        self.ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> i64 {
        self.ns.load(Ordering::SeqCst)
    }

    fn now_ms(&self) -> i64 {
        self.ms.load(Ordering::SeqCst)
    }
}
