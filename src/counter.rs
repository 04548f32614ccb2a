//! Counter-based completion tracking.
//!
//! Counters track the number of live fibers and let a thread block until
//! all of them have finished. Waiters spin briefly before parking on the
//! condition variable, since most waits resolve in microseconds.

use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// A thread-safe countdown latch.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<CounterInner>,
}

struct CounterInner {
    count: AtomicUsize,
    lock: Mutex<()>,
    zero_cv: Condvar,
}

impl Counter {
    /// Creates a new counter with the specified initial value.
    pub fn new(initial: usize) -> Self {
        Counter {
            inner: Arc::new(CounterInner {
                count: AtomicUsize::new(initial),
                lock: Mutex::new(()),
                zero_cv: Condvar::new(),
            }),
        }
    }

    /// Increments the counter by one.
    pub fn increment(&self) {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the counter by one, waking waiters when it reaches zero.
    pub fn decrement(&self) {
        let previous = self.inner.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous != 0, "counter underflow");
        if previous == 1 {
            // Taking the lock orders the store against a waiter that is
            // between its check and its wait.
            let _guard = self.inner.lock.lock().unwrap();
            self.inner.zero_cv.notify_all();
        }
    }

    /// Returns the current value of the counter.
    pub fn value(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Checks if the counter has reached zero.
    pub fn is_complete(&self) -> bool {
        self.value() == 0
    }

    /// Blocks until the counter reaches zero.
    pub fn wait(&self) {
        let backoff = Backoff::new();
        while !self.is_complete() {
            if backoff.is_completed() {
                let guard = self.inner.lock.lock().unwrap();
                let _guard = self
                    .inner
                    .zero_cv
                    .wait_while(guard, |_| !self.is_complete())
                    .unwrap();
                return;
            }
            backoff.snooze();
        }
    }
}

impl Default for Counter {
    fn default() -> Self {
        Counter::new(0)
    }
}
