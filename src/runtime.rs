//! High-level runtime: launches workers, adopts the main-driver policy, and
//! spawns fibers.
//!
//! Construction blocks until every worker policy has registered, so by the
//! time [`FiberRuntime::new`] returns, a spawned fiber can be dispatched to
//! any worker. The constructing thread becomes the main driver: it runs a
//! policy of its own so it can notify and dispatch, but it holds no slot in
//! the rotation and never executes fibers.

use crate::counter::Counter;
use crate::fiber::{Fiber, FiberHandle};
use crate::metrics::MetricsSnapshot;
use crate::policy::{SchedulerPolicy, ThreadPinnedPolicy};
use crate::registry::SchedulerRegistry;
use crate::worker::{Worker, WorkerParams};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("fiber runtime requires at least one worker thread")]
    NoWorkers,
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}

/// State shared between the runtime handle, its workers, and spawners.
pub(crate) struct RuntimeShared {
    pub(crate) registry: Arc<SchedulerRegistry>,
    /// Live (spawned, not yet completed) fibers.
    pub(crate) live: Counter,
    stopping: AtomicBool,
}

impl RuntimeShared {
    pub(crate) fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }
}

struct ThreadBinding {
    shared: Arc<RuntimeShared>,
    policy: Arc<ThreadPinnedPolicy>,
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadBinding>> = const { RefCell::new(None) };
}

/// Records the pool and policy adopted by the current thread.
pub(crate) fn bind_current_thread(shared: &Arc<RuntimeShared>, policy: &Arc<ThreadPinnedPolicy>) {
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(ThreadBinding {
            shared: Arc::clone(shared),
            policy: Arc::clone(policy),
        });
    });
}

fn current_binding() -> Option<(Arc<RuntimeShared>, Arc<ThreadPinnedPolicy>)> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(|b| (Arc::clone(&b.shared), Arc::clone(&b.policy)))
    })
}

fn spawn_inner(
    shared: &Arc<RuntimeShared>,
    policy: &Arc<ThreadPinnedPolicy>,
    body: Box<dyn FnOnce() + Send + 'static>,
    pinned: bool,
) {
    shared.live.increment();
    let ctx = FiberHandle::from_box(Fiber::new(body, pinned));
    if pinned {
        ctx.attach(policy.owner_tag());
    }
    let props = unsafe { ctx.props() };
    policy.awakened(ctx, props);
}

/// Spawns a detached fiber through the calling thread's scheduler.
///
/// The fiber's first wake-up is a dispatch: it is handed to the next worker
/// in the rotation and stays there for life. Callable from the thread that
/// built the runtime and from inside any fiber.
///
/// # Panics
///
/// Panics if the calling thread has not adopted a scheduler.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let (shared, policy) =
        current_binding().expect("spawn requires a thread that has adopted a scheduler");
    spawn_inner(&shared, &policy, Box::new(f), false);
}

/// Spawns a fiber pinned to the calling worker thread.
///
/// Pinned fibers skip the rotation entirely: every wake-up lands on the
/// notifying thread's own queue.
///
/// # Panics
///
/// Panics when called from a thread that is not a worker; only threads that
/// run a scheduling loop can host a pinned fiber.
pub fn spawn_pinned<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let (shared, policy) =
        current_binding().expect("spawn_pinned requires a thread that has adopted a scheduler");
    assert!(
        policy.slot().is_some(),
        "pinned fibers can only be spawned from a worker thread"
    );
    spawn_inner(&shared, &policy, Box::new(f), true);
}

/// A pool of worker threads running the thread-pinning fiber scheduler.
pub struct FiberRuntime {
    shared: Arc<RuntimeShared>,
    workers: Vec<Worker>,
    main_policy: Arc<ThreadPinnedPolicy>,
}

impl FiberRuntime {
    /// Creates a runtime with the given number of worker threads.
    ///
    /// Blocks until every worker has started and registered its policy.
    pub fn new(workers: usize) -> Result<Self, RuntimeError> {
        Self::with_affinity(workers, false)
    }

    /// Creates a runtime whose worker threads are pinned to CPU cores.
    ///
    /// Cores are assigned linearly, wrapping when there are more workers
    /// than cores.
    pub fn with_affinity(workers: usize, pin_threads: bool) -> Result<Self, RuntimeError> {
        if workers == 0 {
            return Err(RuntimeError::NoWorkers);
        }

        let registry = SchedulerRegistry::new(workers);
        let shared = Arc::new(RuntimeShared {
            registry,
            live: Counter::new(0),
            stopping: AtomicBool::new(false),
        });

        let core_ids = if pin_threads {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let workers = (0..workers)
            .map(|index| {
                let core_id = if core_ids.is_empty() {
                    None
                } else {
                    Some(core_ids[index % core_ids.len()])
                };
                Worker::new(WorkerParams {
                    index,
                    shared: Arc::clone(&shared),
                    core_id,
                })
            })
            .collect();

        // The main driver registers last; its adoption blocks until the
        // whole pool is observable, so nothing dispatched after this line
        // can meet an empty registry slot.
        let main_policy = ThreadPinnedPolicy::adopt(&shared.registry, true);
        bind_current_thread(&shared, &main_policy);

        Ok(FiberRuntime {
            shared,
            workers,
            main_policy,
        })
    }

    /// Spawns a detached fiber.
    ///
    /// Routed through the calling thread's scheduler when it has adopted
    /// one of this pool's policies, and through the main driver otherwise.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let policy = match current_binding() {
            Some((shared, policy)) if Arc::ptr_eq(&shared, &self.shared) => policy,
            _ => Arc::clone(&self.main_policy),
        };
        spawn_inner(&self.shared, &policy, Box::new(f), false);
    }

    /// Returns the number of worker threads in the pool.
    pub fn workers(&self) -> usize {
        self.shared.registry.worker_count()
    }

    /// Blocks until every spawned fiber has completed.
    pub fn wait_idle(&self) {
        self.shared.live.wait();
    }

    /// Returns a snapshot of the pool's scheduling counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.registry.metrics().snapshot()
    }

    /// Shuts the pool down: waits for all fibers, then stops and joins the
    /// workers.
    pub fn shutdown(mut self) -> Result<(), RuntimeError> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<(), RuntimeError> {
        self.shared.live.wait();
        self.shared.stop();
        self.shared.registry.for_each_worker(|policy| policy.notify());

        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            let index = worker.index();
            if worker.join().is_err() {
                panicked += 1;
                eprintln!("worker {index} panicked");
            }
        }

        if panicked > 0 {
            Err(RuntimeError::WorkerPanicked(panicked))
        } else {
            Ok(())
        }
    }
}

impl Drop for FiberRuntime {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.shutdown_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_zero_workers_is_rejected() {
        assert!(matches!(
            FiberRuntime::new(0),
            Err(RuntimeError::NoWorkers)
        ));
    }

    #[test]
    fn test_spawn_and_wait() {
        let runtime = FiberRuntime::new(2).unwrap();
        let value = Arc::new(AtomicUsize::new(0));
        let value_clone = value.clone();

        runtime.spawn(move || {
            value_clone.store(42, Ordering::SeqCst);
        });

        runtime.wait_idle();
        assert_eq!(value.load(Ordering::SeqCst), 42);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_spawn_requires_an_adopted_thread() {
        let runtime = FiberRuntime::new(1).unwrap();
        // A thread that never adopted a policy must not be able to use the
        // free-function spawn path.
        let outsider = std::thread::spawn(|| spawn(|| {}));
        assert!(outsider.join().is_err());
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_worker_count_reported() {
        let runtime = FiberRuntime::new(3).unwrap();
        assert_eq!(runtime.workers(), 3);
        runtime.shutdown().unwrap();
    }
}
