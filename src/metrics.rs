use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Scheduling counters for one pool.
///
/// Dispatch counts are kept per worker slot so distribution across the
/// round-robin rotation can be checked after a run.
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// First-wake hand-offs received, indexed by worker slot.
    dispatches: Vec<AtomicU64>,
    /// Enqueues on the notifier's own queue (pinned or re-awakened fibers).
    local_enqueues: AtomicU64,
    /// Contexts received from a peer policy.
    accepts: AtomicU64,
    /// Times a worker blocked in its idle wait.
    parks: AtomicU64,
    /// Wake notifications delivered.
    notifies: AtomicU64,
    start_time: Instant,
}

impl SchedulerMetrics {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            dispatches: (0..workers).map(|_| AtomicU64::new(0)).collect(),
            local_enqueues: AtomicU64::new(0),
            accepts: AtomicU64::new(0),
            parks: AtomicU64::new(0),
            notifies: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn record_dispatch(&self, slot: usize) {
        self.dispatches[slot].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_local_enqueue(&self) {
        self.local_enqueues.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accept(&self) {
        self.accepts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_park(&self) {
        self.parks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_notify(&self) {
        self.notifies.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatches: self
                .dispatches
                .iter()
                .map(|d| d.load(Ordering::Relaxed))
                .collect(),
            local_enqueues: self.local_enqueues.load(Ordering::Relaxed),
            accepts: self.accepts.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
            notifies: self.notifies.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Snapshot of scheduling counters at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub dispatches: Vec<u64>,
    pub local_enqueues: u64,
    pub accepts: u64,
    pub parks: u64,
    pub notifies: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Total first-wake hand-offs across all workers.
    pub fn total_dispatches(&self) -> u64 {
        self.dispatches.iter().sum()
    }

    /// Spread between the busiest and idlest worker's dispatch count.
    pub fn dispatch_imbalance(&self) -> u64 {
        let max = self.dispatches.iter().copied().max().unwrap_or(0);
        let min = self.dispatches.iter().copied().min().unwrap_or(0);
        max - min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = SchedulerMetrics::new(4);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dispatches, vec![0, 0, 0, 0]);
        assert_eq!(snapshot.local_enqueues, 0);
        assert_eq!(snapshot.accepts, 0);
        assert_eq!(snapshot.parks, 0);
        assert_eq!(snapshot.notifies, 0);
        assert!(snapshot.elapsed_seconds >= 0.0);
    }

    #[test]
    fn test_metrics_updates() {
        let metrics = SchedulerMetrics::new(2);
        metrics.record_dispatch(0);
        metrics.record_dispatch(1);
        metrics.record_dispatch(1);
        metrics.record_local_enqueue();
        metrics.record_park();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dispatches, vec![1, 2]);
        assert_eq!(snapshot.total_dispatches(), 3);
        assert_eq!(snapshot.dispatch_imbalance(), 1);
        assert_eq!(snapshot.local_enqueues, 1);
        assert_eq!(snapshot.parks, 1);
    }
}
