//! Allocator-side view of a command buffer: its in-flight fence and a
//! monotonically increasing count of completed submissions.
//!
//! Deferred work records [`CmdBuffer::pending_fence_counter`] when it is
//! queued and becomes eligible once
//! [`CmdBuffer::fence_signaled_counter`] reaches the recorded value.

use crate::allocators::fence::{Fence, FenceManager};
use crate::sync::atomics::AtomicCounter;
use crate::sync::mutex::Mutex;

/// Fence bookkeeping for one command buffer.
#[derive(Debug)]
pub struct CmdBuffer {
    id: u64,
    fence_signaled_counter: AtomicCounter,
    submitted_counter: AtomicCounter,
    in_flight: Mutex<Option<Fence>>,
}

impl CmdBuffer {
    /// Create a tracker with no submissions.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            fence_signaled_counter: AtomicCounter::new(0),
            submitted_counter: AtomicCounter::new(0),
            in_flight: Mutex::new(None),
        }
    }

    /// Caller-chosen identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of submissions observed complete.
    pub fn fence_signaled_counter(&self) -> u64 {
        self.fence_signaled_counter.get()
    }

    /// Counter value the next completion will reach. Work that must outlive
    /// the current recording records this value.
    pub fn pending_fence_counter(&self) -> u64 {
        self.fence_signaled_counter.get() + 1
    }

    /// Number of submissions made.
    pub fn submitted_counter(&self) -> u64 {
        self.submitted_counter.get()
    }

    /// Whether a submission is still awaiting its fence.
    pub fn has_pending_work(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Record a submission guarded by `fence`. Returns the submission count.
    ///
    /// A command buffer has at most one submission in flight; submitting again
    /// before the previous fence is observed is a usage error.
    pub fn submit(&self, fence: Fence) -> u64 {
        let mut slot = self.in_flight.lock();
        crate::ga_assert!(slot.is_none(), GA901, "command buffer {} resubmitted while in flight", self.id);
        *slot = Some(fence);
        self.submitted_counter.increment()
    }

    /// Mark the current recording complete without a fence.
    ///
    /// Used for command buffers whose completion is tracked elsewhere.
    pub fn mark_signaled(&self) -> u64 {
        self.fence_signaled_counter.increment()
    }

    /// Poll the in-flight fence. On completion the counter advances and the
    /// fence returns to the pool. Returns whether work is still pending.
    pub fn refresh_fence_status(&self, fences: &FenceManager) -> bool {
        let completed = {
            let mut slot = self.in_flight.lock();
            let signaled = match slot.as_mut() {
                Some(fence) => fences.is_signaled(fence),
                None => return false,
            };
            if !signaled {
                return true;
            }
            slot.take()
        };
        if let Some(fence) = completed {
            self.fence_signaled_counter.increment();
            fences.release_fence(fence);
        }
        false
    }

    /// Block on the in-flight fence. Returns `false` on timeout.
    pub fn wait(&self, fences: &FenceManager, timeout_ns: u64) -> bool {
        let Some(mut fence) = self.in_flight.lock().take() else {
            return true;
        };
        if fences.wait_for_fence(&mut fence, timeout_ns) {
            self.fence_signaled_counter.increment();
            fences.release_fence(fence);
            true
        } else {
            *self.in_flight.lock() = Some(fence);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DummyDevice;
    use std::sync::Arc;

    #[test]
    fn test_counter_advances_on_signal() {
        let device = Arc::new(DummyDevice::new());
        let fences = FenceManager::new(device.clone());
        let cmd = CmdBuffer::new(7);
        assert_eq!(cmd.pending_fence_counter(), 1);

        let fence = fences.allocate_fence(false).unwrap();
        let handle = fence.handle();
        assert_eq!(cmd.submit(fence), 1);
        assert!(cmd.refresh_fence_status(&fences));
        assert_eq!(cmd.fence_signaled_counter(), 0);

        device.signal_fence(handle);
        assert!(!cmd.refresh_fence_status(&fences));
        assert_eq!(cmd.fence_signaled_counter(), 1);
        assert_eq!(cmd.pending_fence_counter(), 2);
        assert!(!cmd.has_pending_work());
        assert_eq!(fences.stats().free, 1);
    }

    #[test]
    fn test_wait_timeout_keeps_fence() {
        let device = Arc::new(DummyDevice::new());
        let fences = FenceManager::new(device.clone());
        let cmd = CmdBuffer::new(0);
        let fence = fences.allocate_fence(false).unwrap();
        let handle = fence.handle();
        cmd.submit(fence);

        assert!(!cmd.wait(&fences, 10));
        assert!(cmd.has_pending_work());

        device.signal_fence(handle);
        assert!(cmd.wait(&fences, 10));
        assert_eq!(cmd.fence_signaled_counter(), 1);
    }

    #[test]
    fn test_mark_signaled() {
        let cmd = CmdBuffer::new(1);
        assert_eq!(cmd.mark_signaled(), 1);
        assert_eq!(cmd.mark_signaled(), 2);
        assert_eq!(cmd.pending_fence_counter(), 3);
    }
}
