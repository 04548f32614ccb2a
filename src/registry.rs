//! The pool-wide registry of worker policies.
//!
//! One registry exists per pool. It is created before any worker starts and
//! handed to every policy constructor, which registers itself in a slot and
//! then blocks on the construction barrier until all participants (workers
//! plus the main driver) have arrived. Nothing can be dispatched before the
//! barrier opens, so a populated slot table is visible to every dispatcher.

use crate::metrics::SchedulerMetrics;
use crate::policy::SchedulerPolicy;
use std::sync::{Arc, Barrier, Mutex};

struct Slots {
    workers: Vec<Option<Arc<dyn SchedulerPolicy>>>,
    registered: usize,
    cursor: usize,
}

/// Shared state every policy in one pool coordinates through.
pub struct SchedulerRegistry {
    slots: Mutex<Slots>,
    /// Workers plus the main driver.
    ready: Barrier,
    worker_count: usize,
    metrics: SchedulerMetrics,
}

impl SchedulerRegistry {
    /// Creates the registry for a pool of `workers` worker threads.
    ///
    /// The main driver registers too but holds no slot and never receives
    /// dispatches.
    pub fn new(workers: usize) -> Arc<Self> {
        assert!(workers > 0, "a scheduler pool needs at least one worker");
        Arc::new(Self {
            slots: Mutex::new(Slots {
                workers: (0..workers).map(|_| None).collect(),
                registered: 0,
                cursor: 0,
            }),
            ready: Barrier::new(workers + 1),
            worker_count: workers,
            metrics: SchedulerMetrics::new(workers),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Claims the next free slot index for a registering worker policy.
    pub(crate) fn reserve_slot(&self) -> usize {
        let mut slots = self.slots.lock().unwrap();
        assert!(
            slots.registered < slots.workers.len(),
            "more worker policies than registry slots"
        );
        let slot = slots.registered;
        slots.registered += 1;
        slot
    }

    pub(crate) fn install(&self, slot: usize, policy: Arc<dyn SchedulerPolicy>) {
        let mut slots = self.slots.lock().unwrap();
        assert!(
            slots.workers[slot].is_none(),
            "registry slot {slot} claimed twice"
        );
        slots.workers[slot] = Some(policy);
    }

    /// Blocks until every participant has registered.
    pub(crate) fn wait_ready(&self) {
        self.ready.wait();
    }

    /// Advances the round-robin cursor and returns the policy it lands on.
    ///
    /// The advance and the slot read are one operation under the registry
    /// lock, so concurrent dispatches always resolve to distinct cursor
    /// values.
    pub(crate) fn next_target(&self) -> (usize, Arc<dyn SchedulerPolicy>) {
        let mut slots = self.slots.lock().unwrap();
        slots.cursor = (slots.cursor + 1) % slots.workers.len();
        let slot = slots.cursor;
        let target = slots.workers[slot]
            .clone()
            .expect("fiber dispatched before the scheduler pool finished initializing");
        (slot, target)
    }

    pub(crate) fn for_each_worker(&self, mut f: impl FnMut(&Arc<dyn SchedulerPolicy>)) {
        let slots = self.slots.lock().unwrap();
        for policy in slots.workers.iter().flatten() {
            f(policy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{FiberHandle, FiberProps};
    use std::time::Instant;

    struct StubPolicy;

    impl SchedulerPolicy for StubPolicy {
        fn awakened(&self, _ctx: FiberHandle, _props: &FiberProps) {}
        fn accept(&self, _ctx: FiberHandle) {}
        fn pick_next(&self) -> Option<FiberHandle> {
            None
        }
        fn has_ready_fibers(&self) -> bool {
            false
        }
        fn suspend_until(&self, _deadline: Option<Instant>) {}
        fn notify(&self) {}
    }

    fn filled(workers: usize) -> Arc<SchedulerRegistry> {
        let registry = SchedulerRegistry::new(workers);
        for _ in 0..workers {
            let slot = registry.reserve_slot();
            registry.install(slot, Arc::new(StubPolicy));
        }
        registry
    }

    #[test]
    fn test_cursor_cycles_over_all_slots() {
        let registry = filled(3);
        let picks: Vec<usize> = (0..7).map(|_| registry.next_target().0).collect();
        assert_eq!(picks, vec![1, 2, 0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_registration_fills_slots_in_order() {
        let registry = SchedulerRegistry::new(2);
        assert_eq!(registry.reserve_slot(), 0);
        assert_eq!(registry.reserve_slot(), 1);
    }

    #[test]
    #[should_panic(expected = "more worker policies than registry slots")]
    fn test_over_registration_panics() {
        let registry = filled(1);
        registry.reserve_slot();
    }

    #[test]
    #[should_panic(expected = "claimed twice")]
    fn test_double_installation_panics() {
        let registry = SchedulerRegistry::new(1);
        let slot = registry.reserve_slot();
        registry.install(slot, Arc::new(StubPolicy));
        registry.install(slot, Arc::new(StubPolicy));
    }

    #[test]
    #[should_panic(expected = "before the scheduler pool finished initializing")]
    fn test_dispatch_before_initialization_panics() {
        let registry = SchedulerRegistry::new(2);
        registry.next_target();
    }

    #[test]
    #[should_panic(expected = "needs at least one worker")]
    fn test_empty_pool_is_rejected() {
        SchedulerRegistry::new(0);
    }
}
