//! The scheduler-policy contract and its thread-pinning implementation.
//!
//! Each OS thread in a pool adopts one policy instance. A fiber's very first
//! wake-up is a dispatch: the notifying policy detaches the context, picks a
//! worker round-robin through the shared registry, and hands the context
//! over. Every wake-up after that lands in the owning worker's own ready
//! queue, so a fiber never leaves the thread it first ran on. Fiber code can
//! therefore rely on thread-local state staying put across suspensions.

use crate::fiber::{FiberHandle, FiberProps, MAIN_OWNER};
use crate::registry::SchedulerRegistry;
use crossbeam::utils::CachePadded;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// Per-thread scheduling interface the runtime drives.
///
/// `accept` is the one entry point intended for peer policies rather than
/// the owning thread; everything else is called on the thread the instance
/// was adopted on, except `notify`, which peers use to interrupt an idle
/// wait. The `deadline` of `suspend_until` is `None` to wait indefinitely.
pub trait SchedulerPolicy: Send + Sync {
    /// A fiber became ready on this policy's thread.
    fn awakened(&self, ctx: FiberHandle, props: &FiberProps);

    /// Receives a context handed off by a peer policy's dispatch.
    fn accept(&self, ctx: FiberHandle);

    /// Pops the next fiber to resume, if any.
    fn pick_next(&self) -> Option<FiberHandle>;

    fn has_ready_fibers(&self) -> bool;

    /// Blocks the calling thread until notified or until `deadline` passes.
    fn suspend_until(&self, deadline: Option<Instant>);

    /// Wakes this policy's thread out of `suspend_until`.
    fn notify(&self);
}

struct LocalState {
    ready: VecDeque<FiberHandle>,
    /// Wake latch; set by `notify`, cleared when `suspend_until` returns.
    notified: bool,
}

/// Scheduling policy that pins every fiber to its dispatch target.
pub struct ThreadPinnedPolicy {
    registry: Arc<SchedulerRegistry>,
    /// Worker slot in the registry rotation; `None` for the main driver.
    slot: Option<usize>,
    state: CachePadded<Mutex<LocalState>>,
    wake_cv: Condvar,
}

impl ThreadPinnedPolicy {
    /// Builds a policy for the calling thread and registers it with the
    /// pool.
    ///
    /// Blocks until every participant (all workers plus the main driver)
    /// has registered, so no dispatch can ever observe a half-built slot
    /// table. The main driver's instance takes no slot and is excluded
    /// from the rotation.
    pub fn adopt(registry: &Arc<SchedulerRegistry>, main_driver: bool) -> Arc<Self> {
        let slot = if main_driver {
            None
        } else {
            Some(registry.reserve_slot())
        };

        let policy = Arc::new(ThreadPinnedPolicy {
            registry: Arc::clone(registry),
            slot,
            state: CachePadded::new(Mutex::new(LocalState {
                ready: VecDeque::new(),
                notified: false,
            })),
            wake_cv: Condvar::new(),
        });

        if let Some(slot) = slot {
            registry.install(slot, policy.clone() as Arc<dyn SchedulerPolicy>);
        }
        registry.wait_ready();
        policy
    }

    /// Worker slot of this policy, or `None` for the main driver.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub(crate) fn owner_tag(&self) -> usize {
        self.slot.unwrap_or(MAIN_OWNER)
    }

    fn enqueue_local(&self, ctx: FiberHandle) {
        self.state.lock().unwrap().ready.push_back(ctx);
        self.registry.metrics().record_local_enqueue();
    }
}

impl SchedulerPolicy for ThreadPinnedPolicy {
    fn awakened(&self, ctx: FiberHandle, props: &FiberProps) {
        // Pinned contexts always stay with the notifying thread.
        if ctx.is_pinned() {
            self.enqueue_local(ctx);
            return;
        }
        if props.was_previously_awakened() {
            self.enqueue_local(ctx);
            return;
        }

        // First wake: this decides the fiber's permanent worker. The
        // registry lock is released before calling into the target, which
        // takes its own queue lock in `accept`.
        ctx.detach();
        let (slot, target) = self.registry.next_target();
        props.set_previously_awakened();
        self.registry.metrics().record_dispatch(slot);
        target.accept(ctx);
        target.notify();
    }

    fn accept(&self, ctx: FiberHandle) {
        self.state.lock().unwrap().ready.push_back(ctx);
        self.registry.metrics().record_accept();
    }

    fn pick_next(&self) -> Option<FiberHandle> {
        let ctx = self.state.lock().unwrap().ready.pop_front()?;
        // A dispatched context arrives detached; take ownership here.
        // Pinned contexts never change owner.
        if !ctx.is_pinned() {
            ctx.attach(self.owner_tag());
        }
        Some(ctx)
    }

    fn has_ready_fibers(&self) -> bool {
        !self.state.lock().unwrap().ready.is_empty()
    }

    fn suspend_until(&self, deadline: Option<Instant>) {
        self.registry.metrics().record_park();
        let mut state = self.state.lock().unwrap();
        match deadline {
            None => {
                while !state.notified {
                    state = self.wake_cv.wait(state).unwrap();
                }
            }
            Some(deadline) => loop {
                if state.notified {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self.wake_cv.wait_timeout(state, deadline - now).unwrap();
                state = guard;
            },
        }
        state.notified = false;
    }

    fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        state.notified = true;
        drop(state);
        self.wake_cv.notify_all();
        self.registry.metrics().record_notify();
    }
}
