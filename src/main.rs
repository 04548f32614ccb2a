use fiberpin::FiberRuntime;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FIBERS: usize = 100;
const ITERATIONS: usize = 5;

fn main() {
    let workers = std::env::var("FIBERPIN_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(16);

    let runtime = match FiberRuntime::new(workers) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            std::process::exit(1);
        }
    };
    println!("fiberpin demo: {workers} workers, {FIBERS} fibers, {ITERATIONS} iterations each\n");

    let completed = Arc::new(AtomicUsize::new(0));
    let migrations = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    for id in 0..FIBERS {
        let completed = Arc::clone(&completed);
        let migrations = Arc::clone(&migrations);
        runtime.spawn(move || {
            // The thread a fiber first runs on is its home for life; any
            // change between iterations would be a scheduler bug.
            let home_thread = std::thread::current().id();
            let home_worker = fiberpin::current_worker_index();

            for _ in 0..ITERATIONS {
                fiberpin::sleep_for(Duration::from_millis(10));
                if std::thread::current().id() != home_thread
                    || fiberpin::current_worker_index() != home_worker
                {
                    migrations.fetch_add(1, Ordering::SeqCst);
                    eprintln!("WARNING: fiber {id} migrated threads");
                }
            }

            completed.fetch_add(1, Ordering::SeqCst);
        });
    }

    runtime.wait_idle();
    println!(
        "completed {} fibers in {:?}",
        completed.load(Ordering::SeqCst),
        start.elapsed()
    );
    println!(
        "thread migrations observed: {}\n",
        migrations.load(Ordering::SeqCst)
    );

    let metrics = runtime.metrics();
    for (slot, dispatches) in metrics.dispatches.iter().enumerate() {
        println!("  worker {slot:2}: {dispatches} fibers dispatched");
    }
    println!(
        "\nlocal enqueues: {}, parks: {}, notifies: {}",
        metrics.local_enqueues, metrics.parks, metrics.notifies
    );

    match runtime.shutdown() {
        Ok(()) => println!("all workers joined"),
        Err(err) => eprintln!("shutdown error: {err}"),
    }

    if let Ok(path) = std::env::var("FIBERPIN_TRACE") {
        match fiberpin::tracing::export_chrome_trace(&path) {
            Ok(()) => println!("trace written to {path}"),
            Err(err) => eprintln!("failed to write trace: {err}"),
        }
    }
}
