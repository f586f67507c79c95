//! Phi accrual failure detection.
//!
//! Each peer gets a bounded window of heartbeat inter-arrival samples; phi is
//! a continuous suspicion level derived from how long the current silence is
//! compared to the sampled distribution. Running sum and sum-of-squares keep
//! mean and variance O(1) per report.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::config::Distribution;
use crate::membership::types::NodeId;

/// Per-peer sliding window of inter-arrival samples, in nanoseconds.
struct ArrivalWindow {
    intervals: VecDeque<f64>,
    sum: f64,
    sum_squares: f64,
    last_arrival_ns: i64,
    capacity: usize,
}

impl ArrivalWindow {
    fn new(capacity: usize, first_arrival_ns: i64) -> Self {
        Self {
            intervals: VecDeque::with_capacity(capacity.min(1024)),
            sum: 0.0,
            sum_squares: 0.0,
            last_arrival_ns: first_arrival_ns,
            capacity,
        }
    }

    fn record(&mut self, now_ns: i64) {
        let interval = (now_ns - self.last_arrival_ns).max(0) as f64;
        while self.intervals.len() >= self.capacity {
            if let Some(evicted) = self.intervals.pop_front() {
                self.sum -= evicted;
                self.sum_squares -= evicted * evicted;
            }
        }
        self.intervals.push_back(interval);
        self.sum += interval;
        self.sum_squares += interval * interval;
        self.last_arrival_ns = now_ns;
    }

    fn mean(&self) -> f64 {
        self.sum / self.intervals.len() as f64
    }

    fn variance(&self) -> f64 {
        let mean = self.mean();
        (self.sum_squares / self.intervals.len() as f64 - mean * mean).max(0.0)
    }

    fn phi(&self, now_ns: i64, minimum_samples: usize, distribution: Distribution) -> f64 {
        if self.intervals.len() < minimum_samples {
            return 0.0;
        }
        let elapsed = (now_ns - self.last_arrival_ns).max(0) as f64;
        let mean = self.mean();
        if mean <= 0.0 {
            return 0.0;
        }
        match distribution {
            Distribution::Exponential => elapsed / (mean * std::f64::consts::LN_10),
            Distribution::Normal => {
                let stdev = self.variance().sqrt().max(mean / 1.0e4);
                let y = (elapsed - mean) / stdev;
                -gaussian_tail(y, elapsed > mean).max(f64::MIN_POSITIVE).log10()
            }
        }
    }
}

/// P(X >= elapsed) for a standard-normal y, via the logistic approximation
/// of the Gaussian CDF (accurate to ~1.4e-4, no erf dependency).
fn gaussian_tail(y: f64, above_mean: bool) -> f64 {
    let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
    if above_mean {
        e / (1.0 + e)
    } else {
        1.0 - 1.0 / (1.0 + e)
    }
}

/// Accrual failure detector over all known peers.
///
/// Never blocks and never fails: a peer with no arrivals yet has no phi at
/// all, and a peer with fewer than `minimum_samples` samples reports 0
/// (cannot convict yet).
pub struct FailureDetector {
    windows: DashMap<NodeId, ArrivalWindow>,
    window_size: usize,
    minimum_samples: usize,
    distribution: Distribution,
}

impl FailureDetector {
    pub fn new(window_size: usize, minimum_samples: usize, distribution: Distribution) -> Self {
        Self {
            windows: DashMap::new(),
            window_size: window_size.max(1),
            minimum_samples: minimum_samples.max(1),
            distribution,
        }
    }

    /// Records a heartbeat arrival for the peer at monotonic `now_ns`.
    /// The first arrival only anchors the window; samples start with the
    /// second.
    pub fn report(&self, peer: &NodeId, now_ns: i64) {
        match self.windows.get_mut(peer) {
            Some(mut window) => window.record(now_ns),
            None => {
                self.windows
                    .insert(peer.clone(), ArrivalWindow::new(self.window_size, now_ns));
            }
        }
    }

    /// Current suspicion level for the peer, or `None` if no arrival was
    /// ever observed (the refresher leaves such peers untouched).
    pub fn phi(&self, peer: &NodeId, now_ns: i64) -> Option<f64> {
        self.windows
            .get(peer)
            .map(|window| window.phi(now_ns, self.minimum_samples, self.distribution))
    }

    /// Number of inter-arrival samples recorded for the peer.
    pub fn sample_count(&self, peer: &NodeId) -> usize {
        self.windows
            .get(peer)
            .map(|window| window.intervals.len())
            .unwrap_or(0)
    }
}
