//! Pooled native fences.
//!
//! Creating and destroying sync objects every frame is expensive, so released
//! fences are reset and parked for reuse.

use std::sync::Arc;

use crate::gpu::{FenceHandle, GpuAllocError, GpuDevice};
use crate::sync::mutex::Mutex;

/// Observed state of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Submitted work has not been observed complete.
    NotReady,
    /// The device signaled the fence.
    Signaled,
}

/// One pooled native fence.
///
/// The state is a cache: it only moves to `Signaled` when the manager polls or
/// waits, and only back to `NotReady` through a reset.
#[derive(Debug)]
pub struct Fence {
    handle: FenceHandle,
    state: FenceState,
}

impl Fence {
    /// Native handle, for queue submission.
    pub fn handle(&self) -> FenceHandle {
        self.handle
    }

    /// Last observed state.
    pub fn state(&self) -> FenceState {
        self.state
    }
}

#[derive(Default)]
struct FencePool {
    free: Vec<FenceHandle>,
    /// Released after a timed-out wait; the device may still signal them.
    retiring: Vec<FenceHandle>,
    in_use: usize,
}

/// Snapshot of fence pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceStats {
    pub in_use: usize,
    pub free: usize,
    pub retiring: usize,
}

/// Pool of native fences.
pub struct FenceManager {
    device: Arc<dyn GpuDevice>,
    pool: Mutex<FencePool>,
}

impl FenceManager {
    /// Create an empty pool.
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            pool: Mutex::new(FencePool::default()),
        }
    }

    /// Take a fence from the pool, creating one if the pool is empty.
    ///
    /// Pooled fences are always unsignaled, so a signaled request always
    /// creates a fresh native object.
    pub fn allocate_fence(&self, create_signaled: bool) -> Result<Fence, GpuAllocError> {
        if !create_signaled {
            self.recycle_retiring();
        }
        let reused = {
            let mut pool = self.pool.lock();
            let reused = if create_signaled { None } else { pool.free.pop() };
            pool.in_use += 1;
            reused
        };

        let handle = match reused {
            Some(handle) => handle,
            None => match self.device.create_fence(create_signaled) {
                Ok(handle) => handle,
                Err(err) => {
                    self.pool.lock().in_use -= 1;
                    return Err(err);
                }
            },
        };

        Ok(Fence {
            handle,
            state: if create_signaled { FenceState::Signaled } else { FenceState::NotReady },
        })
    }

    /// Poll the native status unless the fence is already known signaled.
    pub fn is_signaled(&self, fence: &mut Fence) -> bool {
        if fence.state == FenceState::Signaled {
            return true;
        }
        match self.device.fence_status(fence.handle) {
            Ok(true) => {
                fence.state = FenceState::Signaled;
                true
            }
            Ok(false) => false,
            Err(err) => {
                crate::ga_emit_ctx!(GA901, "fence status query failed: {}", err);
                false
            }
        }
    }

    /// Block until the fence signals or `timeout_ns` elapses.
    ///
    /// Returns `false` on timeout and leaves the fence state unchanged so the
    /// caller can retry. No pool lock is held while waiting.
    pub fn wait_for_fence(&self, fence: &mut Fence, timeout_ns: u64) -> bool {
        if fence.state == FenceState::Signaled {
            return true;
        }
        match self.device.wait_for_fence(fence.handle, timeout_ns) {
            Ok(true) => {
                fence.state = FenceState::Signaled;
                true
            }
            Ok(false) => false,
            Err(err) => {
                crate::ga_emit_ctx!(GA901, "fence wait failed: {}", err);
                false
            }
        }
    }

    /// Return the fence to `NotReady`.
    ///
    /// The native reset always runs: the cached state may be stale when the
    /// device signaled after the last poll.
    pub fn reset_fence(&self, fence: &mut Fence) {
        self.try_reset(fence);
    }

    fn try_reset(&self, fence: &mut Fence) -> bool {
        match self.device.reset_fence(fence.handle) {
            Ok(()) => {
                fence.state = FenceState::NotReady;
                true
            }
            Err(err) => {
                crate::ga_emit_ctx!(GA901, "fence reset failed: {}", err);
                false
            }
        }
    }

    /// Reset the fence and park it for reuse. A fence that cannot be reset is
    /// destroyed instead.
    ///
    /// The fence must not guard pending work; use
    /// [`wait_and_release_fence`](Self::wait_and_release_fence) when it might.
    pub fn release_fence(&self, mut fence: Fence) {
        if !self.try_reset(&mut fence) {
            self.device.destroy_fence(fence.handle);
            self.pool.lock().in_use -= 1;
            return;
        }
        let mut pool = self.pool.lock();
        pool.in_use -= 1;
        pool.free.push(fence.handle);
    }

    /// Wait for the fence, then release it. Returns whether it signaled.
    ///
    /// A timed-out fence still guards pending work, so it is parked until a
    /// later [`allocate_fence`](Self::allocate_fence) observes it signaled.
    pub fn wait_and_release_fence(&self, mut fence: Fence, timeout_ns: u64) -> bool {
        if self.wait_for_fence(&mut fence, timeout_ns) {
            self.release_fence(fence);
            return true;
        }
        let mut pool = self.pool.lock();
        pool.in_use -= 1;
        pool.retiring.push(fence.handle);
        false
    }

    /// Move retiring fences that have signaled back to the free list.
    fn recycle_retiring(&self) {
        let retiring = {
            let mut pool = self.pool.lock();
            if pool.retiring.is_empty() {
                return;
            }
            std::mem::take(&mut pool.retiring)
        };

        let mut still_pending = Vec::new();
        let mut recycled = Vec::new();
        for handle in retiring {
            match self.device.fence_status(handle) {
                Ok(true) => match self.device.reset_fence(handle) {
                    Ok(()) => recycled.push(handle),
                    Err(err) => {
                        crate::ga_emit_ctx!(GA901, "fence reset failed: {}", err);
                        self.device.destroy_fence(handle);
                    }
                },
                Ok(false) => still_pending.push(handle),
                Err(err) => {
                    crate::ga_emit_ctx!(GA901, "fence status query failed: {}", err);
                    still_pending.push(handle);
                }
            }
        }

        let mut pool = self.pool.lock();
        pool.retiring.extend(still_pending);
        pool.free.extend(recycled);
    }

    /// Pool occupancy.
    pub fn stats(&self) -> FenceStats {
        let pool = self.pool.lock();
        FenceStats {
            in_use: pool.in_use,
            free: pool.free.len(),
            retiring: pool.retiring.len(),
        }
    }

    /// Destroy every pooled fence, including ones still retiring.
    pub fn deinit(&self) {
        let (free, in_use) = {
            let mut pool = self.pool.lock();
            let mut free = std::mem::take(&mut pool.free);
            free.append(&mut pool.retiring);
            (free, pool.in_use)
        };
        for handle in free {
            self.device.destroy_fence(handle);
        }
        if in_use > 0 {
            crate::ga_emit_ctx!(GA402, "{} fence(s) outstanding", in_use);
        }
    }
}

impl Drop for FenceManager {
    fn drop(&mut self) {
        let free = {
            let mut pool = self.pool.lock();
            let mut free = std::mem::take(&mut pool.free);
            free.append(&mut pool.retiring);
            free
        };
        for handle in free {
            self.device.destroy_fence(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DummyDevice;

    fn setup() -> (Arc<DummyDevice>, FenceManager) {
        let device = Arc::new(DummyDevice::new());
        let manager = FenceManager::new(device.clone());
        (device, manager)
    }

    #[test]
    fn test_state_machine() {
        let (device, manager) = setup();
        let mut fence = manager.allocate_fence(false).unwrap();
        assert!(!manager.is_signaled(&mut fence));
        assert_eq!(fence.state(), FenceState::NotReady);

        device.signal_fence(fence.handle());
        assert!(manager.is_signaled(&mut fence));
        assert_eq!(fence.state(), FenceState::Signaled);

        manager.reset_fence(&mut fence);
        assert_eq!(fence.state(), FenceState::NotReady);
        assert!(!manager.is_signaled(&mut fence));

        manager.release_fence(fence);
    }

    #[test]
    fn test_released_fence_is_reused_unsignaled() {
        let (device, manager) = setup();
        let fence = manager.allocate_fence(false).unwrap();
        let handle = fence.handle();
        device.signal_fence(handle);
        manager.release_fence(fence);

        let mut again = manager.allocate_fence(false).unwrap();
        assert_eq!(again.handle(), handle);
        assert!(!manager.is_signaled(&mut again));
        assert_eq!(device.live_fence_count(), 1);
        manager.release_fence(again);
    }

    #[test]
    fn test_signal_after_timed_out_wait_is_reset() {
        let (device, manager) = setup();
        let fence = manager.allocate_fence(false).unwrap();
        let handle = fence.handle();
        assert!(!manager.wait_and_release_fence(fence, 10));
        device.signal_fence(handle);

        let mut again = manager.allocate_fence(false).unwrap();
        assert_eq!(again.handle(), handle);
        assert!(!manager.is_signaled(&mut again));
        manager.release_fence(again);
    }

    #[test]
    fn test_timed_out_fence_is_not_reused_while_pending() {
        let (device, manager) = setup();
        let fence = manager.allocate_fence(false).unwrap();
        let handle = fence.handle();
        assert!(!manager.wait_and_release_fence(fence, 10));
        assert_eq!(manager.stats(), FenceStats { in_use: 0, free: 0, retiring: 1 });

        let other = manager.allocate_fence(false).unwrap();
        assert_ne!(other.handle(), handle);
        assert_eq!(manager.stats().retiring, 1);

        manager.release_fence(other);
        manager.deinit();
        assert_eq!(device.live_fence_count(), 0);
    }

    #[test]
    fn test_create_signaled() {
        let (_device, manager) = setup();
        let mut fence = manager.allocate_fence(true).unwrap();
        assert!(manager.is_signaled(&mut fence));
        assert!(manager.wait_for_fence(&mut fence, 0));
        manager.release_fence(fence);
        assert_eq!(manager.stats(), FenceStats { in_use: 0, free: 1, retiring: 0 });
    }

    #[test]
    fn test_wait_timeout_leaves_state() {
        let (_device, manager) = setup();
        let mut fence = manager.allocate_fence(false).unwrap();
        assert!(!manager.wait_for_fence(&mut fence, 1_000));
        assert_eq!(fence.state(), FenceState::NotReady);
        assert!(!manager.wait_and_release_fence(fence, 1_000));
        assert_eq!(manager.stats().in_use, 0);
    }

    #[test]
    fn test_deinit_destroys_pool() {
        let (device, manager) = setup();
        let a = manager.allocate_fence(false).unwrap();
        let b = manager.allocate_fence(false).unwrap();
        manager.release_fence(a);
        manager.release_fence(b);
        manager.deinit();
        assert_eq!(device.live_fence_count(), 0);
    }
}
