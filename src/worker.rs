//! Worker thread implementation.
//!
//! Each worker adopts a [`ThreadPinnedPolicy`] and then loops: drain the
//! policy's ready queue, promote expired sleepers back through `awakened`
//! (which keeps them on this worker), and park in `suspend_until` when
//! there is nothing to do. Sleeping fibers are per-worker state, so a
//! suspended fiber can only ever reappear on the thread it already ran on.

use crate::fiber::{FiberHandle, FiberState, SuspendReason};
use crate::policy::{SchedulerPolicy, ThreadPinnedPolicy};
use crate::runtime::{self, RuntimeShared};
use crate::tracing;
use core_affinity::CoreId;
use std::cell::Cell;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

thread_local! {
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the worker running the current thread, if any.
///
/// Because fibers never migrate, a fiber observes the same value at every
/// point of its life.
pub fn current_worker_index() -> Option<usize> {
    WORKER_INDEX.get()
}

/// A worker thread driving the fiber scheduler.
pub(crate) struct Worker {
    index: usize,
    handle: Option<JoinHandle<()>>,
}

/// Parameters for creating a new worker thread.
pub(crate) struct WorkerParams {
    pub(crate) index: usize,
    pub(crate) shared: Arc<RuntimeShared>,
    pub(crate) core_id: Option<CoreId>,
}

/// A fiber parked until its deadline; ordered earliest-deadline-first.
struct Sleeper {
    deadline: Instant,
    ctx: FiberHandle,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the binary heap pops the nearest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

impl Worker {
    pub(crate) fn new(params: WorkerParams) -> Self {
        let index = params.index;
        let handle = thread::Builder::new()
            .name(format!("fiberpin-worker-{index}"))
            .spawn(move || {
                if let Some(core_id) = params.core_id {
                    core_affinity::set_for_current(core_id);
                }

                let policy = ThreadPinnedPolicy::adopt(&params.shared.registry, false);
                WORKER_INDEX.set(policy.slot());
                runtime::bind_current_thread(&params.shared, &policy);

                let _collector = tracing::CollectorGuard;
                Worker::run_loop(&params.shared, &policy);
            })
            .expect("failed to spawn worker thread");

        Worker {
            index,
            handle: Some(handle),
        }
    }

    fn run_loop(shared: &Arc<RuntimeShared>, policy: &Arc<ThreadPinnedPolicy>) {
        let worker = policy.slot().expect("worker policy without a slot");
        let mut sleepers: BinaryHeap<Sleeper> = BinaryHeap::new();

        loop {
            while let Some(ctx) = policy.pick_next() {
                Worker::run_fiber(ctx, worker, shared, policy, &mut sleepers);
            }

            let now = Instant::now();
            while sleepers.peek().is_some_and(|s| s.deadline <= now) {
                let ctx = sleepers.pop().unwrap().ctx;
                policy.awakened(ctx, unsafe { ctx.props() });
            }
            if policy.has_ready_fibers() {
                continue;
            }
            if shared.stopping() && sleepers.is_empty() {
                break;
            }

            let deadline = sleepers.peek().map(|s| s.deadline);
            let _park = tracing::TraceGuard::new("park", worker);
            policy.suspend_until(deadline);
        }
    }

    fn run_fiber(
        ctx: FiberHandle,
        worker: usize,
        shared: &Arc<RuntimeShared>,
        policy: &Arc<ThreadPinnedPolicy>,
        sleepers: &mut BinaryHeap<Sleeper>,
    ) {
        debug_assert!(ctx.is_pinned() || ctx.owner() == policy.owner_tag());

        // Own the box for the duration of the run; a suspended fiber is
        // leaked right back, so queued copies of the handle stay valid.
        let mut fiber = unsafe { ctx.into_box() };

        let state = {
            let _span = tracing::TraceGuard::new("run", worker);
            fiber.resume()
        };

        match state {
            FiberState::Suspended(SuspendReason::Yield) => {
                let ctx = FiberHandle::from_box(fiber);
                policy.awakened(ctx, unsafe { ctx.props() });
            }
            FiberState::Suspended(SuspendReason::SleepUntil(deadline)) => {
                sleepers.push(Sleeper {
                    deadline,
                    ctx: FiberHandle::from_box(fiber),
                });
            }
            FiberState::Complete => {
                drop(fiber);
                shared.live.decrement();
            }
            FiberState::Panicked(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    *s
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.as_str()
                } else {
                    "unknown panic payload"
                };
                eprintln!("fiber panicked: {msg}");
                drop(fiber);
                shared.live.decrement();
            }
        }
    }

    /// Returns the worker's index.
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Waits for the worker thread to finish.
    pub(crate) fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sleepers_pop_earliest_first() {
        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        for offset in [30u64, 10, 20] {
            heap.push(Sleeper {
                deadline: base + Duration::from_millis(offset),
                ctx: FiberHandle(std::ptr::null_mut()),
            });
        }

        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|s| s.deadline)).collect();
        assert_eq!(
            order,
            vec![
                base + Duration::from_millis(10),
                base + Duration::from_millis(20),
                base + Duration::from_millis(30),
            ]
        );
    }

    #[test]
    fn test_worker_index_unset_off_workers() {
        assert_eq!(current_worker_index(), None);
    }
}
