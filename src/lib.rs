//! # Fiberpin - Thread-Pinning Fiber Scheduler
//!
//! A cooperative fiber runtime whose scheduling policy pins every fiber to
//! the worker thread it first ran on. Newly spawned fibers are distributed
//! across workers in round-robin order; from then on every wake-up lands in
//! the same worker's ready queue, so fiber code can rely on thread-local
//! state staying put across sleeps and yields.
//!
//! ## Architecture
//!
//! Each OS thread in the pool adopts a [`ThreadPinnedPolicy`]. The policies
//! of one pool share a [`SchedulerRegistry`] that holds the round-robin
//! cursor and a slot per worker; a construction barrier guarantees the
//! registry is fully populated before any fiber can be dispatched. Key
//! pieces:
//!
//! - **Fibers**: stackful execution contexts that suspend at explicit
//!   points (`yield_now`, `sleep_for`)
//! - **Policy**: decides where an awakened fiber runs; first wake picks the
//!   permanent worker, later wakes stay local
//! - **Registry**: the rotation state all policies coordinate through
//! - **Workers**: OS threads that drain their policy's queue and park when
//!   idle
//!
//! ## Example
//!
//! ```no_run
//! use fiberpin::FiberRuntime;
//! use std::time::Duration;
//!
//! let runtime = FiberRuntime::new(4).unwrap();
//!
//! runtime.spawn(|| {
//!     // Runs on one worker and stays there, across every sleep.
//!     fiberpin::sleep_for(Duration::from_millis(10));
//!     println!("hello from a pinned fiber");
//! });
//!
//! runtime.shutdown().unwrap();
//! ```

pub mod counter;
pub mod fiber;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod tracing;
pub mod worker;

pub use counter::Counter;
pub use fiber::{sleep_for, sleep_until, yield_now, FiberHandle, FiberProps};
pub use metrics::MetricsSnapshot;
pub use policy::{SchedulerPolicy, ThreadPinnedPolicy};
pub use registry::SchedulerRegistry;
pub use runtime::{spawn, spawn_pinned, FiberRuntime, RuntimeError};
pub use worker::current_worker_index;
