//! Fiber contexts and their execution state.
//!
//! A fiber is a stackful coroutine (via `corosensei`) owned by the runtime.
//! The scheduling policy only ever sees [`FiberHandle`]s: non-owning pointers
//! to fibers whose storage is managed by the worker resuming them. A handle
//! is valid from the moment the fiber is spawned until the worker that runs
//! it observes completion.

use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Owner tag for a context no policy currently owns.
pub(crate) const UNOWNED: usize = usize::MAX;
/// Owner tag for the main driver's policy, which holds no worker slot.
pub(crate) const MAIN_OWNER: usize = usize::MAX - 1;

/// Non-owning reference to a fiber.
///
/// Wraps a raw pointer so ready queues can move fibers between threads; the
/// runtime guarantees the pointee outlives every queued copy of the handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FiberHandle(pub(crate) *mut Fiber);

unsafe impl Send for FiberHandle {}
unsafe impl Sync for FiberHandle {}

impl FiberHandle {
    pub(crate) fn from_box(fiber: Box<Fiber>) -> Self {
        FiberHandle(Box::into_raw(fiber))
    }

    /// Reclaims ownership of the fiber's storage.
    ///
    /// # Safety
    ///
    /// The handle must have come from [`FiberHandle::from_box`] and no other
    /// copy of it may be dereferenced afterwards.
    pub(crate) unsafe fn into_box(self) -> Box<Fiber> {
        Box::from_raw(self.0)
    }

    /// Scheduling properties of the fiber behind this handle.
    ///
    /// # Safety
    ///
    /// The fiber must still be alive.
    pub(crate) unsafe fn props<'a>(self) -> &'a FiberProps {
        &(*self.0).props
    }

    pub(crate) fn is_pinned(self) -> bool {
        unsafe { (*self.0).pinned }
    }

    /// Releases the context from its owning policy so another thread may
    /// attach it.
    pub(crate) fn detach(self) {
        unsafe { (*self.0).owner.store(UNOWNED, Ordering::Release) };
    }

    /// Records `tag` as the policy that now owns this context.
    pub(crate) fn attach(self, tag: usize) {
        unsafe { (*self.0).owner.store(tag, Ordering::Release) };
    }

    pub(crate) fn owner(self) -> usize {
        unsafe { (*self.0).owner.load(Ordering::Acquire) }
    }
}

/// Scheduling property the runtime attaches to every fiber.
///
/// The flag flips once, on the fiber's first wake-up, and is how the policy
/// tells the dispatch decision apart from every later re-enqueue.
pub struct FiberProps {
    previously_awakened: AtomicBool,
}

impl FiberProps {
    fn new() -> Self {
        FiberProps {
            previously_awakened: AtomicBool::new(false),
        }
    }

    pub fn was_previously_awakened(&self) -> bool {
        self.previously_awakened.load(Ordering::Acquire)
    }

    /// One-way transition; calling it again has no effect.
    pub fn set_previously_awakened(&self) {
        self.previously_awakened.store(true, Ordering::Release);
    }
}

/// Why a running fiber handed control back to its worker.
#[derive(Clone, Copy, Debug)]
pub(crate) enum SuspendReason {
    /// Ready to run again immediately.
    Yield,
    /// Not runnable before the deadline.
    SleepUntil(Instant),
}

/// Resume input; the first resume carries the fiber's own address so the
/// coroutine can capture its yielder.
pub(crate) enum FiberInput {
    Start(*mut Fiber),
    Resume,
}

pub(crate) enum FiberState {
    Suspended(SuspendReason),
    Complete,
    Panicked(Box<dyn std::any::Any + Send>),
}

/// A stackful execution context plus the scheduling state attached to it.
pub struct Fiber {
    coroutine: Option<Coroutine<FiberInput, SuspendReason, ()>>,

    /// Set when the fiber first runs; valid while the coroutine is alive.
    yielder: *const Yielder<FiberInput, SuspendReason>,

    started: bool,
    pinned: bool,
    props: FiberProps,

    /// Tag of the policy that currently owns this context.
    owner: AtomicUsize,
}

unsafe impl Send for Fiber {}

thread_local! {
    static CURRENT_FIBER: Cell<Option<FiberHandle>> = const { Cell::new(None) };
}

impl Fiber {
    pub(crate) fn new(body: Box<dyn FnOnce() + Send + 'static>, pinned: bool) -> Box<Fiber> {
        let coroutine = Coroutine::new(move |yielder, input: FiberInput| {
            if let FiberInput::Start(fiber_ptr) = input {
                // SAFETY: the worker passes the fiber's own boxed address on
                // the first resume, and the box is not moved while running.
                unsafe {
                    (*fiber_ptr).yielder = yielder as *const _;
                }
                body();
            }
        });

        Box::new(Fiber {
            coroutine: Some(coroutine),
            yielder: std::ptr::null(),
            started: false,
            pinned,
            props: FiberProps::new(),
            owner: AtomicUsize::new(UNOWNED),
        })
    }

    /// Runs the fiber until it suspends or finishes.
    pub(crate) fn resume(&mut self) -> FiberState {
        let self_ptr = self as *mut Fiber;
        let input = if self.started {
            FiberInput::Resume
        } else {
            self.started = true;
            FiberInput::Start(self_ptr)
        };

        let Some(coroutine) = self.coroutine.as_mut() else {
            return FiberState::Complete;
        };

        CURRENT_FIBER.set(Some(FiberHandle(self_ptr)));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            coroutine.resume(input)
        }));
        CURRENT_FIBER.set(None);

        match result {
            Ok(CoroutineResult::Yield(reason)) => FiberState::Suspended(reason),
            Ok(CoroutineResult::Return(())) => FiberState::Complete,
            Err(payload) => FiberState::Panicked(payload),
        }
    }

    /// Handle of the fiber running on the current thread, if any.
    pub(crate) fn current() -> Option<FiberHandle> {
        CURRENT_FIBER.get()
    }
}

fn suspend(reason: SuspendReason) -> bool {
    let Some(handle) = Fiber::current() else {
        return false;
    };
    // SAFETY: CURRENT_FIBER is only set while the fiber is being resumed, so
    // the pointer and its yielder are valid here.
    unsafe {
        let fiber = &*handle.0;
        assert!(
            !fiber.yielder.is_null(),
            "fiber suspended before its first resume"
        );
        let _ = (*fiber.yielder).suspend(reason);
    }
    true
}

/// Suspends the current fiber and re-enqueues it on its worker.
///
/// Falls back to an OS thread yield when called outside a fiber.
pub fn yield_now() {
    if !suspend(SuspendReason::Yield) {
        std::thread::yield_now();
    }
}

/// Suspends the current fiber until `deadline` at the earliest.
///
/// Falls back to an OS thread sleep when called outside a fiber.
pub fn sleep_until(deadline: Instant) {
    if !suspend(SuspendReason::SleepUntil(deadline)) {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/// Suspends the current fiber for at least `duration`.
pub fn sleep_for(duration: Duration) {
    sleep_until(Instant::now() + duration);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_props_transition_is_one_way() {
        let props = FiberProps::new();
        assert!(!props.was_previously_awakened());

        props.set_previously_awakened();
        assert!(props.was_previously_awakened());

        props.set_previously_awakened();
        assert!(props.was_previously_awakened());
    }

    #[test]
    fn test_fiber_runs_to_completion() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();

        let mut fiber = Fiber::new(
            Box::new(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        );

        assert!(matches!(fiber.resume(), FiberState::Complete));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fiber_yields_and_resumes() {
        let steps = Arc::new(AtomicUsize::new(0));
        let steps_clone = steps.clone();

        let mut fiber = Fiber::new(
            Box::new(move || {
                steps_clone.fetch_add(1, Ordering::SeqCst);
                yield_now();
                steps_clone.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        );

        assert!(matches!(
            fiber.resume(),
            FiberState::Suspended(SuspendReason::Yield)
        ));
        assert_eq!(steps.load(Ordering::SeqCst), 1);

        assert!(matches!(fiber.resume(), FiberState::Complete));
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sleep_yields_the_deadline() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let mut fiber = Fiber::new(Box::new(move || sleep_until(deadline)), false);

        match fiber.resume() {
            FiberState::Suspended(SuspendReason::SleepUntil(observed)) => {
                assert_eq!(observed, deadline);
            }
            _ => panic!("expected a sleep suspension"),
        }
        assert!(matches!(fiber.resume(), FiberState::Complete));
    }

    #[test]
    fn test_panic_is_captured() {
        let mut fiber = Fiber::new(Box::new(|| panic!("boom")), false);
        assert!(matches!(fiber.resume(), FiberState::Panicked(_)));
    }

    #[test]
    fn test_yield_outside_fiber_is_a_thread_yield() {
        // Must not panic or hang.
        yield_now();
        sleep_for(Duration::from_millis(1));
    }
}
