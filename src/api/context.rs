//! The allocator context.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::allocators::{
    BufferPool, BufferSuballocation, CmdBuffer, DeferredDeletionQueue, DeviceMemoryManager,
    FenceManager, FrameScratchAllocator, HeapManager, PageSuballocation, ScratchAllocation,
    StagingBuffer, StagingManager,
};
use crate::api::config::GpuAllocConfig;
use crate::api::stats::GpuMemoryStats;
use crate::core::FrameClock;
use crate::diagnostics::ProfilerHooks;
use crate::gpu::{
    BufferUsage, DeviceSize, FenceHandle, GpuAllocError, GpuDevice, GpuMemoryIntent,
    MemoryPropertyFlags, MemoryRequirements, NativeHandle,
};

/// Owns every pool for one device.
///
/// All methods take `&self`; the context is `Send + Sync` and can be shared
/// behind an `Arc`. Call [`tick`](Self::tick) once per frame, after the
/// frame's command buffers have been submitted.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use gpualloc::{BufferUsage, DummyDevice, GpuAllocConfig, GpuMemory, MemoryPropertyFlags};
///
/// let memory = GpuMemory::new(Arc::new(DummyDevice::new()), GpuAllocConfig::default())?;
///
/// let vertices = memory.allocate_buffer(
///     4096,
///     BufferUsage::VERTEX_BUFFER,
///     MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
/// )?;
/// vertices.write(0, &[0u8; 64])?;
///
/// let _constants = memory.alloc_scratch(256, 1)?;
/// memory.tick();
/// # Ok::<(), gpualloc::GpuAllocError>(())
/// ```
pub struct GpuMemory {
    config: GpuAllocConfig,
    clock: Arc<FrameClock>,
    dmm: Arc<DeviceMemoryManager>,
    heaps: HeapManager,
    buffers: BufferPool,
    staging: StagingManager,
    fences: FenceManager,
    deferred: DeferredDeletionQueue,
    scratch: FrameScratchAllocator,
    next_cmd_buffer_id: AtomicU64,
    shut_down: AtomicBool,
}

impl GpuMemory {
    /// Create a context over `device`.
    pub fn new(device: Arc<dyn GpuDevice>, config: GpuAllocConfig) -> Result<Self, GpuAllocError> {
        if config.device_local_page_size == 0
            || config.host_visible_page_size == 0
            || config.buffer_allocation_size == 0
            || config.scratch_initial_size == 0
        {
            return Err(GpuAllocError::InvalidSize);
        }

        crate::diagnostics::init_from_env();

        let hooks = Arc::new(ProfilerHooks::new());
        let clock = Arc::new(FrameClock::new());
        let dmm = Arc::new(DeviceMemoryManager::new(device.clone(), hooks));

        Ok(Self {
            heaps: HeapManager::new(dmm.clone(), clock.clone(), &config),
            buffers: BufferPool::new(dmm.clone(), config.buffer_allocation_size),
            staging: StagingManager::new(dmm.clone(), clock.clone(), config.staging_free_frames),
            fences: FenceManager::new(device.clone()),
            deferred: DeferredDeletionQueue::new(device),
            scratch: FrameScratchAllocator::new(
                dmm.clone(),
                config.frames_in_flight,
                config.scratch_initial_size,
                config.scratch_usage,
            ),
            config,
            clock,
            dmm,
            next_cmd_buffer_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &GpuAllocConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        self.dmm.device()
    }

    /// Raw device memory manager shared by every pool.
    pub fn device_memory(&self) -> &Arc<DeviceMemoryManager> {
        &self.dmm
    }

    /// Hooks receiving every raw allocation, free and frame mark.
    pub fn profiler_hooks(&self) -> &Arc<ProfilerHooks> {
        self.dmm.hooks()
    }

    /// Current frame number.
    pub fn frame(&self) -> u64 {
        self.clock.current()
    }

    pub fn heaps(&self) -> &HeapManager {
        &self.heaps
    }

    pub fn fences(&self) -> &FenceManager {
        &self.fences
    }

    pub fn deferred(&self) -> &DeferredDeletionQueue {
        &self.deferred
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Suballocate `size` bytes of a pooled buffer.
    pub fn allocate_buffer(
        &self,
        size: DeviceSize,
        usage: BufferUsage,
        properties: MemoryPropertyFlags,
    ) -> Result<BufferSuballocation, GpuAllocError> {
        self.ensure_live()?;
        self.buffers.allocate(size, 1, usage, properties)
    }

    /// Like [`allocate_buffer`](Self::allocate_buffer) with an explicit
    /// minimum alignment for the returned offset.
    pub fn allocate_buffer_aligned(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        usage: BufferUsage,
        properties: MemoryPropertyFlags,
    ) -> Result<BufferSuballocation, GpuAllocError> {
        self.ensure_live()?;
        self.buffers.allocate(size, alignment, usage, properties)
    }

    /// Suballocate memory for a resource the caller binds itself.
    pub fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        intent: GpuMemoryIntent,
    ) -> Result<PageSuballocation, GpuAllocError> {
        self.ensure_live()?;
        self.heaps.allocate_for_intent(requirements, intent)
    }

    /// Host-visible buffer for CPU to GPU copies.
    pub fn acquire_staging_buffer(&self, size: DeviceSize) -> Result<StagingBuffer, GpuAllocError> {
        self.ensure_live()?;
        self.staging.acquire(size, BufferUsage::TRANSFER_SRC, false)
    }

    /// Host-visible, preferably cached, buffer for GPU to CPU copies.
    pub fn acquire_readback_buffer(&self, size: DeviceSize) -> Result<StagingBuffer, GpuAllocError> {
        self.ensure_live()?;
        self.staging.acquire(size, BufferUsage::TRANSFER_DST, true)
    }

    /// Return a staging buffer. It is reused once `cmd`'s current recording
    /// retires, or right away when `cmd` is `None`.
    pub fn release_staging_buffer(&self, cmd: Option<&Arc<CmdBuffer>>, buffer: StagingBuffer) {
        self.staging.release(cmd, buffer);
    }

    /// Flush CPU writes to a staging buffer.
    pub fn flush_staging_buffer(&self, buffer: &StagingBuffer) -> Result<(), GpuAllocError> {
        self.staging.flush(buffer)
    }

    /// Make GPU writes to a readback buffer visible to the CPU.
    pub fn invalidate_staging_buffer(&self, buffer: &StagingBuffer) -> Result<(), GpuAllocError> {
        self.staging.invalidate(buffer)
    }

    /// Per-frame scratch memory, valid until this frame's slot comes around
    /// again.
    pub fn alloc_scratch(&self, size: DeviceSize, alignment: DeviceSize) -> Result<ScratchAllocation, GpuAllocError> {
        self.ensure_live()?;
        self.scratch.alloc(size, alignment)
    }

    // -------------------------------------------------------------------------
    // Submission tracking
    // -------------------------------------------------------------------------

    /// New command buffer tracker with a unique id.
    pub fn create_cmd_buffer(&self) -> Arc<CmdBuffer> {
        Arc::new(CmdBuffer::new(self.next_cmd_buffer_id.fetch_add(1, Ordering::Relaxed)))
    }

    /// Record a submission of `cmd`. Returns the fence the native submit must
    /// signal.
    ///
    /// Plain [`defer_destroy`](Self::defer_destroy) calls made after this wait
    /// for this submission.
    pub fn submit(&self, cmd: &Arc<CmdBuffer>) -> Result<FenceHandle, GpuAllocError> {
        self.ensure_live()?;
        let fence = self.fences.allocate_fence(false)?;
        let handle = fence.handle();
        cmd.submit(fence);
        self.deferred.on_cmd_buffer_submitted(cmd);
        Ok(handle)
    }

    /// Poll `cmd`'s fence. Returns whether work is still pending.
    pub fn refresh_cmd_buffer(&self, cmd: &CmdBuffer) -> bool {
        cmd.refresh_fence_status(&self.fences)
    }

    /// Block on `cmd`'s fence with the configured timeout. Returns `false` on
    /// timeout.
    pub fn wait_cmd_buffer(&self, cmd: &CmdBuffer) -> bool {
        cmd.wait(&self.fences, self.config.default_fence_timeout_ns)
    }

    /// Destroy `handle` once the last submitted command buffer retires.
    pub fn defer_destroy(&self, handle: NativeHandle) {
        self.deferred.enqueue(handle);
    }

    /// Destroy `handle` once `cmd`'s current recording retires.
    pub fn defer_destroy_for(&self, cmd: &Arc<CmdBuffer>, handle: NativeHandle) {
        self.deferred.enqueue_for(cmd, handle);
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Destroy deferred objects whose command buffer has retired.
    pub fn release_resources(&self, immediate: bool) -> usize {
        self.deferred.release_resources(immediate)
    }

    /// Recycle retired staging buffers and drop idle ones.
    pub fn process_pending_free(&self, immediate: bool, release_to_os: bool) -> usize {
        self.staging.process_pending_free(immediate, release_to_os)
    }

    /// Destroy expired free pages, at most one per heap.
    pub fn release_freed_pages(&self) -> usize {
        self.heaps.release_freed_pages()
    }

    /// Frame boundary. Advances the clock, runs every maintenance pass and
    /// rotates the scratch slot. Returns the new frame number.
    pub fn tick(&self) -> u64 {
        let frame = self.clock.advance();
        self.dmm.set_frame(frame);

        let deferred = self.deferred.release_resources(false);
        let staging = self.staging.process_pending_free(false, false);
        let pages = self.heaps.release_freed_pages();
        self.scratch.advance_frame();

        #[cfg(feature = "log")]
        if deferred + staging + pages > 0 {
            log::trace!(
                "gpualloc frame {}: {} deferred, {} staging, {} pages released",
                frame,
                deferred,
                staging,
                pages
            );
        }
        #[cfg(not(feature = "log"))]
        let _ = (deferred, staging, pages);

        self.dmm.hooks().emit_frame_mark(frame);
        frame
    }

    pub fn stats(&self) -> GpuMemoryStats {
        GpuMemoryStats {
            frame: self.clock.current(),
            heaps: self.dmm.heap_usage(),
            device_allocation_count: self.dmm.allocation_count(),
            resource_heaps: self.heaps.stats(),
            buffer_pool: self.buffers.stats(),
            staging: self.staging.stats(),
            fences: self.fences.stats(),
            deferred_deletions: self.deferred.len(),
            scratch: self.scratch.stats(),
        }
    }

    /// Emit the current statistics as a diagnostic note.
    pub fn dump_memory(&self) {
        crate::ga_emit_ctx!(GA404, "\n{}", self.stats());
    }

    /// Destroy everything now, ignoring fences. Live suballocations and
    /// leaked device memory are reported. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.deferred.release_resources(true);
        self.staging.deinit();
        self.scratch.deinit();
        self.buffers.deinit();
        self.heaps.deinit();
        self.fences.deinit();
        self.dmm.report_leaks();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<(), GpuAllocError> {
        if self.is_shut_down() {
            return Err(GpuAllocError::Backend("allocator is shut down".to_string()));
        }
        Ok(())
    }
}

impl Drop for GpuMemory {
    fn drop(&mut self) {
        self.shutdown();
    }
}
