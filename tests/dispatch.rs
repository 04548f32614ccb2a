//! Round-robin distribution of first wake-ups.

use fiberpin::FiberRuntime;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

#[test]
fn two_fibers_land_on_distinct_workers() {
    let runtime = FiberRuntime::new(2).unwrap();
    let homes: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..2 {
        let homes = Arc::clone(&homes);
        runtime.spawn(move || {
            homes.lock().unwrap().push(std::thread::current().id());
            // Keep the worker busy so both fibers are observed in flight.
            fiberpin::sleep_for(Duration::from_millis(20));
        });
    }

    runtime.wait_idle();
    runtime.shutdown().unwrap();

    let homes = homes.lock().unwrap();
    assert_eq!(homes.len(), 2);
    assert_ne!(homes[0], homes[1], "cursor did not advance between wakes");
}

#[test]
fn hundred_fibers_over_sixteen_workers() {
    let runtime = FiberRuntime::new(16).unwrap();
    let total = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let total = Arc::clone(&total);
        runtime.spawn(move || {
            for _ in 0..5 {
                fiberpin::yield_now();
                total.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    runtime.wait_idle();
    let metrics = runtime.metrics();
    runtime.shutdown().unwrap();

    assert_eq!(total.load(Ordering::SeqCst), 500);
    assert_eq!(metrics.total_dispatches(), 100);
    // 100 fibers over 16 slots: every worker hosts 6 or 7.
    for &dispatches in &metrics.dispatches {
        assert!((6u64..=7).contains(&dispatches), "uneven spread: {dispatches}");
    }
}

#[test]
fn dispatch_from_one_notifier_is_fair() {
    let runtime = FiberRuntime::new(4).unwrap();

    for _ in 0..64 {
        runtime.spawn(|| {});
    }

    runtime.wait_idle();
    let metrics = runtime.metrics();
    runtime.shutdown().unwrap();

    // All first wakes came from the main thread in sequence, so the
    // rotation is exact.
    assert_eq!(metrics.dispatches, vec![16, 16, 16, 16]);
    assert_eq!(metrics.dispatch_imbalance(), 0);
}

#[test]
fn nested_spawns_are_dispatched_too() {
    let runtime = FiberRuntime::new(4).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let completed = Arc::clone(&completed);
        runtime.spawn(move || {
            for _ in 0..4 {
                let completed = Arc::clone(&completed);
                fiberpin::spawn(move || {
                    completed.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
    }

    runtime.wait_idle();
    let metrics = runtime.metrics();
    runtime.shutdown().unwrap();

    assert_eq!(completed.load(Ordering::SeqCst), 16);
    // 4 outer + 16 inner fibers, every one dispatched exactly once.
    assert_eq!(metrics.total_dispatches(), 20);
}
