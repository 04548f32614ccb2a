//! Chrome Tracing collector for scheduler visualization.
//!
//! Records fiber-run and park spans into thread-local buffers, one lane per
//! worker, with no cross-thread contention on the hot path. The collected
//! spans can be exported to a JSON file compatible with chrome://tracing or
//! ui.perfetto.dev.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A single complete event in Chrome Tracing format.
#[derive(Debug, Clone)]
pub struct TraceSpan {
    pub name: &'static str,
    pub worker: usize,
    pub start_us: u64,
    pub duration_us: u64,
}

thread_local! {
    static SPAN_BUFFER: RefCell<Vec<TraceSpan>> = RefCell::new(Vec::with_capacity(4096));
}

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref EPOCH_START_US: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    static ref ALL_BUFFERS: Mutex<Vec<Vec<TraceSpan>>> = Mutex::new(Vec::new());
}

/// Records a span of scheduler work on the current thread.
pub fn record_span(name: &'static str, worker: usize, start: Instant, end: Instant) {
    let start_us = start.duration_since(*GLOBAL_START).as_micros() as u64 + *EPOCH_START_US;
    let duration_us = end.duration_since(start).as_micros() as u64;

    SPAN_BUFFER.with(|buffer| {
        buffer.borrow_mut().push(TraceSpan {
            name,
            worker,
            start_us,
            duration_us,
        });
    });
}

/// Moves the current thread's buffer into the global list.
///
/// Each worker does this once, at thread exit, via [`CollectorGuard`].
pub fn collect_local_spans() {
    SPAN_BUFFER.with(|buffer| {
        let mut local = buffer.borrow_mut();
        if !local.is_empty() {
            let mut global = ALL_BUFFERS.lock().unwrap();
            global.push(std::mem::take(&mut *local));
        }
    });
}

/// Exports all collected spans to a chrome://tracing JSON file.
pub fn export_chrome_trace(path: &str) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let buffers = ALL_BUFFERS.lock().unwrap();

    writeln!(writer, "[")?;
    let mut first = true;
    for buffer in buffers.iter() {
        for span in buffer {
            if !first {
                writeln!(writer, ",")?;
            }
            first = false;
            write!(
                writer,
                "{{\"name\":\"{}\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}}}",
                span.name, span.start_us, span.duration_us, span.worker
            )?;
        }
    }
    writeln!(writer, "\n]")?;
    writer.flush()
}

/// RAII span: records from construction to drop.
pub struct TraceGuard {
    name: &'static str,
    worker: usize,
    start: Instant,
}

impl TraceGuard {
    pub fn new(name: &'static str, worker: usize) -> Self {
        Self {
            name,
            worker,
            start: Instant::now(),
        }
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        record_span(self.name, self.worker, self.start, Instant::now());
    }
}

/// RAII guard that flushes the thread's buffer when dropped.
pub struct CollectorGuard;

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        collect_local_spans();
    }
}
