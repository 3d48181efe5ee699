//! Staging and readback buffers.
//!
//! Each staging buffer is a native buffer with its own mapped allocation,
//! sized exactly to the request. Released buffers stay parked behind their
//! command buffer's fence counter until the GPU has finished copying, then
//! idle in a free pool where an identical request can pick them up again.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocators::buffer_pool::create_mapped_buffer;
use crate::allocators::cmd_buffer::CmdBuffer;
use crate::allocators::device_memory::{
    copy_from_mapped, copy_to_mapped, DeviceMemoryAllocation, DeviceMemoryManager,
};
use crate::core::FrameClock;
use crate::gpu::{BufferHandle, BufferUsage, DeviceSize, GpuAllocError, MemoryPropertyFlags};
use crate::sync::atomics::AtomicGauge;
use crate::sync::mutex::Mutex;

/// A mapped host-visible buffer for copies to or from the device.
#[derive(Debug)]
pub struct StagingBuffer {
    buffer: BufferHandle,
    memory: DeviceMemoryAllocation,
    size: DeviceSize,
    usage: BufferUsage,
    cpu_read: bool,
}

impl StagingBuffer {
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn size(&self) -> DeviceSize {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Whether this is a readback buffer.
    pub fn is_cpu_read(&self) -> bool {
        self.cpu_read
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.memory.mapped_ptr()
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write(&self, offset: DeviceSize, data: &[u8]) -> Result<(), GpuAllocError> {
        copy_to_mapped(self.memory.mapped_ptr(), self.size, offset, data)
    }

    /// Copy from the buffer at `offset` into `out`.
    pub fn read(&self, offset: DeviceSize, out: &mut [u8]) -> Result<(), GpuAllocError> {
        copy_from_mapped(self.memory.mapped_ptr(), self.size, offset, out)
    }

    fn matches(&self, size: DeviceSize, usage: BufferUsage, cpu_read: bool) -> bool {
        self.size == size && self.usage == usage && self.cpu_read == cpu_read
    }
}

struct PendingEntry {
    cmd: Arc<CmdBuffer>,
    fence_counter: u64,
    buffer: StagingBuffer,
}

struct FreeEntry {
    buffer: StagingBuffer,
    frame: u64,
}

#[derive(Default)]
struct StagingState {
    pending: Vec<PendingEntry>,
    free: Vec<FreeEntry>,
    used_buffers: usize,
}

/// Staging pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingStats {
    pub used_bytes: DeviceSize,
    pub peak_used_bytes: DeviceSize,
    pub pending_bytes: DeviceSize,
    pub free_bytes: DeviceSize,
    pub used_buffers: usize,
    pub pending_buffers: usize,
    pub free_buffers: usize,
}

/// Fence-gated pool of staging buffers.
pub struct StagingManager {
    dmm: Arc<DeviceMemoryManager>,
    clock: Arc<FrameClock>,
    free_frames: u64,
    used_bytes: AtomicGauge,
    state: Mutex<StagingState>,
}

impl StagingManager {
    /// `free_frames` is how long an idle buffer is kept before it is destroyed.
    pub fn new(dmm: Arc<DeviceMemoryManager>, clock: Arc<FrameClock>, free_frames: u64) -> Self {
        Self {
            dmm,
            clock,
            free_frames,
            used_bytes: AtomicGauge::new(),
            state: Mutex::new(StagingState::default()),
        }
    }

    /// Get a mapped buffer of exactly `size` bytes.
    ///
    /// Readback buffers (`cpu_read`) prefer cached memory.
    pub fn acquire(&self, size: DeviceSize, usage: BufferUsage, cpu_read: bool) -> Result<StagingBuffer, GpuAllocError> {
        if size == 0 {
            return Err(GpuAllocError::InvalidSize);
        }
        {
            let mut state = self.state.lock();
            if let Some(index) = state.free.iter().position(|e| e.buffer.matches(size, usage, cpu_read)) {
                let entry = state.free.swap_remove(index);
                state.used_buffers += 1;
                self.used_bytes.add(size);
                return Ok(entry.buffer);
            }
        }

        let buffer = self.create(size, usage, cpu_read)?;
        self.state.lock().used_buffers += 1;
        self.used_bytes.add(size);
        Ok(buffer)
    }

    /// Bytes held by callers, readable without the pool lock.
    pub fn used_bytes(&self) -> DeviceSize {
        self.used_bytes.get()
    }

    fn create(&self, size: DeviceSize, usage: BufferUsage, cpu_read: bool) -> Result<StagingBuffer, GpuAllocError> {
        let properties = if cpu_read {
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED
        } else {
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT
        };
        let (buffer, memory) = create_mapped_buffer(&self.dmm, size, usage, properties)?;
        Ok(StagingBuffer {
            buffer,
            memory,
            size,
            usage,
            cpu_read,
        })
    }

    /// Give a buffer back.
    ///
    /// With an owning command buffer the buffer waits until that command
    /// buffer's current recording has retired; without one it is immediately
    /// reusable.
    pub fn release(&self, cmd: Option<&Arc<CmdBuffer>>, buffer: StagingBuffer) {
        let mut state = self.state.lock();
        self.used_bytes.sub(buffer.size);
        state.used_buffers -= 1;
        match cmd {
            Some(cmd) => state.pending.push(PendingEntry {
                fence_counter: cmd.pending_fence_counter(),
                cmd: cmd.clone(),
                buffer,
            }),
            None => state.free.push(FreeEntry {
                buffer,
                frame: self.clock.current(),
            }),
        }
    }

    /// Move retired pending buffers to the free pool and destroy idle ones.
    ///
    /// `immediate` treats every pending buffer as retired; `release_to_os`
    /// destroys every free buffer regardless of age. Returns how many buffers
    /// were destroyed.
    pub fn process_pending_free(&self, immediate: bool, release_to_os: bool) -> usize {
        let now = self.clock.current();
        let doomed = {
            let mut state = self.state.lock();

            let mut index = 0;
            while index < state.pending.len() {
                let entry = &state.pending[index];
                if immediate || entry.cmd.fence_signaled_counter() >= entry.fence_counter {
                    let entry = state.pending.swap_remove(index);
                    state.free.push(FreeEntry {
                        buffer: entry.buffer,
                        frame: now,
                    });
                } else {
                    index += 1;
                }
            }

            let mut doomed = Vec::new();
            let mut index = 0;
            while index < state.free.len() {
                if release_to_os || now.saturating_sub(state.free[index].frame) > self.free_frames {
                    doomed.push(state.free.swap_remove(index).buffer);
                } else {
                    index += 1;
                }
            }
            doomed
        };

        let count = doomed.len();
        for buffer in doomed {
            self.destroy(buffer);
        }
        count
    }

    fn destroy(&self, buffer: StagingBuffer) {
        self.dmm.device().destroy_buffer(buffer.buffer);
        self.dmm.free(buffer.memory);
    }

    /// Flush CPU writes. No-op on coherent memory.
    pub fn flush(&self, buffer: &StagingBuffer) -> Result<(), GpuAllocError> {
        self.dmm.flush(&buffer.memory, 0, buffer.size)
    }

    /// Invalidate before reading device writes. No-op on coherent memory.
    pub fn invalidate(&self, buffer: &StagingBuffer) -> Result<(), GpuAllocError> {
        self.dmm.invalidate(&buffer.memory, 0, buffer.size)
    }

    pub fn stats(&self) -> StagingStats {
        let state = self.state.lock();
        StagingStats {
            used_bytes: self.used_bytes.get(),
            peak_used_bytes: self.used_bytes.peak(),
            pending_bytes: state.pending.iter().map(|e| e.buffer.size).sum(),
            free_bytes: state.free.iter().map(|e| e.buffer.size).sum(),
            used_buffers: state.used_buffers,
            pending_buffers: state.pending.len(),
            free_buffers: state.free.len(),
        }
    }

    /// Destroy every pending and free buffer. Buffers still held by callers
    /// are reported.
    pub fn deinit(&self) {
        self.process_pending_free(true, true);
        let used = self.state.lock().used_buffers;
        if used > 0 {
            crate::ga_emit_ctx!(GA401, "{} staging buffer(s) never released", used);
        }
    }
}

impl Drop for StagingManager {
    fn drop(&mut self) {
        self.process_pending_free(true, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ProfilerHooks;
    use crate::gpu::DummyDevice;

    struct Fixture {
        device: Arc<DummyDevice>,
        clock: Arc<FrameClock>,
        staging: StagingManager,
    }

    fn fixture(free_frames: u64) -> Fixture {
        let device = Arc::new(DummyDevice::new());
        let dmm = Arc::new(DeviceMemoryManager::new(device.clone(), Arc::new(ProfilerHooks::new())));
        let clock = Arc::new(FrameClock::new());
        let staging = StagingManager::new(dmm, clock.clone(), free_frames);
        Fixture { device, clock, staging }
    }

    #[test]
    fn test_reuse_after_fence() {
        let f = fixture(10);
        let cmd = Arc::new(CmdBuffer::new(0));

        let first = f.staging.acquire(1024, BufferUsage::TRANSFER_SRC, false).unwrap();
        let handle = first.buffer();
        f.staging.release(Some(&cmd), first);

        f.staging.process_pending_free(false, false);
        assert_eq!(f.staging.stats().pending_buffers, 1);

        cmd.mark_signaled();
        f.staging.process_pending_free(false, false);
        assert_eq!(f.staging.stats().free_buffers, 1);

        let again = f.staging.acquire(1024, BufferUsage::TRANSFER_SRC, false).unwrap();
        assert_eq!(again.buffer(), handle);

        let other = f.staging.acquire(2048, BufferUsage::TRANSFER_SRC, false).unwrap();
        assert_ne!(other.buffer(), handle);
        assert_eq!(f.device.live_buffer_count(), 2);
    }

    #[test]
    fn test_mismatch_is_not_reused() {
        let f = fixture(10);
        let a = f.staging.acquire(256, BufferUsage::TRANSFER_SRC, false).unwrap();
        let handle = a.buffer();
        f.staging.release(None, a);

        let readback = f.staging.acquire(256, BufferUsage::TRANSFER_SRC, true).unwrap();
        assert_ne!(readback.buffer(), handle);
        let other_usage = f.staging.acquire(256, BufferUsage::TRANSFER_DST, false).unwrap();
        assert_ne!(other_usage.buffer(), handle);
    }

    #[test]
    fn test_idle_buffers_expire() {
        let f = fixture(2);
        let a = f.staging.acquire(64, BufferUsage::TRANSFER_SRC, false).unwrap();
        f.staging.release(None, a);

        f.clock.advance();
        f.clock.advance();
        assert_eq!(f.staging.process_pending_free(false, false), 0);
        f.clock.advance();
        assert_eq!(f.staging.process_pending_free(false, false), 1);
        assert_eq!(f.device.live_buffer_count(), 0);
        assert_eq!(f.device.live_memory_count(), 0);
    }

    #[test]
    fn test_immediate_and_release_to_os() {
        let f = fixture(100);
        let cmd = Arc::new(CmdBuffer::new(3));
        let a = f.staging.acquire(64, BufferUsage::TRANSFER_SRC, false).unwrap();
        f.staging.release(Some(&cmd), a);

        assert_eq!(f.staging.process_pending_free(true, false), 0);
        assert_eq!(f.staging.stats().free_buffers, 1);
        assert_eq!(f.staging.process_pending_free(false, true), 1);
        assert_eq!(f.device.live_buffer_count(), 0);
    }

    #[test]
    fn test_stats_and_mapping() {
        let f = fixture(10);
        let a = f.staging.acquire(128, BufferUsage::TRANSFER_SRC, false).unwrap();
        let b = f.staging.acquire(64, BufferUsage::TRANSFER_DST, true).unwrap();
        a.write(0, &[7; 128]).unwrap();
        assert!(a.write(1, &[7; 128]).is_err());
        assert!(b.is_cpu_read());
        f.staging.invalidate(&b).unwrap();

        let stats = f.staging.stats();
        assert_eq!(stats.used_bytes, 192);
        assert_eq!(stats.used_buffers, 2);

        f.staging.release(None, a);
        f.staging.release(None, b);
        let stats = f.staging.stats();
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.peak_used_bytes, 192);
        assert_eq!(stats.free_bytes, 192);
    }
}
