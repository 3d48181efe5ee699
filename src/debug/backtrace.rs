//! Device allocation backtrace tracking.
//!
//! Records where each live device allocation was made so the shutdown leak
//! report can point at the owner.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::sync::mutex::Mutex;

/// A captured backtrace for one device allocation.
#[derive(Clone)]
pub struct AllocationTrace {
    pub handle: u64,
    pub size: u64,
    pub memory_type_index: u32,
    /// Frame the allocation was made in.
    pub frame: u64,
    pub backtrace: String,
}

/// Tracker for live device allocations.
pub struct BacktraceTracker {
    traces: Mutex<HashMap<u64, AllocationTrace>>,
    frame: AtomicU64,
}

impl BacktraceTracker {
    pub fn new() -> Self {
        Self {
            traces: Mutex::new(HashMap::new()),
            frame: AtomicU64::new(0),
        }
    }

    /// Record an allocation with its backtrace.
    pub fn record_alloc(&self, handle: u64, size: u64, memory_type_index: u32) {
        let trace = AllocationTrace {
            handle,
            size,
            memory_type_index,
            frame: self.frame.load(Ordering::Relaxed),
            backtrace: format!("{:?}", backtrace::Backtrace::new()),
        };
        self.traces.lock().insert(handle, trace);
    }

    /// Remove an allocation record.
    pub fn record_free(&self, handle: u64) {
        self.traces.lock().remove(&handle);
    }

    /// Set the frame stamped on new records.
    pub fn set_frame(&self, frame: u64) {
        self.frame.store(frame, Ordering::Relaxed);
    }

    /// All live allocations.
    pub fn active_allocations(&self) -> Vec<AllocationTrace> {
        self.traces.lock().values().cloned().collect()
    }

    /// Human-readable leak report, `None` when nothing leaked.
    pub fn leak_report(&self) -> Option<String> {
        let traces = self.traces.lock();
        if traces.is_empty() {
            return None;
        }
        let mut out = format!("{} live device allocation(s)\n", traces.len());
        for trace in traces.values() {
            let _ = writeln!(
                out,
                "  memory 0x{:x}: {} bytes, type {}, frame {}\n{}",
                trace.handle, trace.size, trace.memory_type_index, trace.frame, trace.backtrace
            );
        }
        Some(out)
    }
}

impl Default for BacktraceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_report() {
        let tracker = BacktraceTracker::new();
        assert!(tracker.leak_report().is_none());

        tracker.set_frame(3);
        tracker.record_alloc(0x10, 4096, 1);
        let active = tracker.active_allocations();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].frame, 3);

        let report = tracker.leak_report().unwrap();
        assert!(report.contains("4096 bytes"));

        tracker.record_free(0x10);
        assert!(tracker.leak_report().is_none());
    }
}
